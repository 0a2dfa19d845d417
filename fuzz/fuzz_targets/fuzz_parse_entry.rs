// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

#![no_main]

use libfuzzer_sys::fuzz_target;
use parasol::entries::Entry;

fuzz_target!(|data: &[u8]| {
    let _ = Entry::parse(data, 0);
});
