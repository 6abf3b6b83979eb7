#![no_main]

use libfuzzer_sys::fuzz_target;
use concord::transaction::LedgerUpdate;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes that happen to decode as an update must get a verdict
    // from the contract, and the same verdict twice.
    if let Ok(update) = concord::deserialize::<LedgerUpdate>(data) {
        let first = concord::contract::verify(&update);
        assert_eq!(first, concord::contract::verify(&update));
        let _ = update.id();
    }
});
