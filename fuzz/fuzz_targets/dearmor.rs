#![no_main]

use libfuzzer_sys::fuzz_target;
use mailkeys_engine::armor;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Armor parsing must never panic on arbitrary text.
    let _ = armor::dearmor(text);
    let _ = armor::dearmor_all(text);
    let _ = armor::clip_incomplete(text);
});
