#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = mailkeys_policy::inspect_message(data);
    let _ = mailkeys_policy::signature_issuers(data);
    let _ = mailkeys_engine::msg::recipient_longids(data);
});
