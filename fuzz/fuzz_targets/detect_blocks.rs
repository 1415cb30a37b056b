#![no_main]

use libfuzzer_sys::fuzz_target;
use mailkeys_engine::blocks::detect_blocks;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let detected = detect_blocks(&text);
    let rebuilt: String = detected.blocks.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(rebuilt, detected.normalized);
});
