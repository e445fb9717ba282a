#![no_main]

use glacier_core::seed::parse_mnemonic;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // parse_mnemonic must never panic on arbitrary text
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_mnemonic(s);
    }
});
