// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Log backend that forwards messages through the nano layer's debug gate.

use log::{Metadata, Record};

const MAX_MSG_LEN: usize = 256;

pub struct CairnLogger;

impl log::Log for CairnLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool { true }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            extern "C" {
                fn nano_debug_log(level: u8, msg: *const u8, msg_len: usize);
            }
            use core2::io::{Cursor, Write};
            let mut buf = [0u8; MAX_MSG_LEN];
            let mut cur = Cursor::new(&mut buf[..]);
            // Log msgs are of the form: '<target>::<fmt'd-msg>'
            write!(&mut cur, "{}::{}", record.target(), record.args()).unwrap_or_else(|_| {
                // Too big, indicate overflow with a trailing "...".
                cur.set_position((MAX_MSG_LEN - 3) as u64);
                cur.write(b"...").expect("write!");
            });
            let pos = cur.position() as usize;
            unsafe { nano_debug_log(record.level() as u8, buf.as_ptr(), pos) }
        }
    }

    fn flush(&self) {}
}
