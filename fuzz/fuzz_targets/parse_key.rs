#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = mailkeys_engine::parse(data);
    let result = mailkeys_engine::read_many(data);
    for key in &result.keys {
        let _ = mailkeys_engine::armor_key(key);
        let _ = mailkeys_engine::longids(key);
    }
});
