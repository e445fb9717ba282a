#![no_main]

use bitcoin::script::PushBytesBuf;
use bitcoin::{Script, ScriptBuf};
use glacier_lock::script::{build_lock_marker, is_lock_marker, parse_lock_marker};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes as an output script: may be truncated or contain bad pushes
    let raw = Script::from_bytes(data);
    let _ = is_lock_marker(raw);
    let _ = parse_lock_marker(raw);

    // Same bytes as an OP_RETURN payload to reach the text parser
    if let Ok(payload) = PushBytesBuf::try_from(data.to_vec()) {
        let script = ScriptBuf::new_op_return(payload);
        if let Some(height) = parse_lock_marker(&script) {
            assert!(is_lock_marker(&script));
            let rebuilt = build_lock_marker(height).unwrap();
            assert_eq!(parse_lock_marker(&rebuilt), Some(height));
        }
    }
});
