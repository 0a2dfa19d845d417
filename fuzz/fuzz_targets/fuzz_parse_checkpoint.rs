// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

#![no_main]

use libfuzzer_sys::fuzz_target;
use parasol::checkpoint::parse_checkpoint;

fuzz_target!(|data: &[u8]| {
    let _ = parse_checkpoint(data, &[0u8; 32]);
});
