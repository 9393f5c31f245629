#![no_main]

use diverdown::filter::EventFilter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing must never panic, and accepted sets only hold call/return kinds
        if let Ok(filter) = EventFilter::from_expr(input) {
            for kind in filter.events().kinds() {
                assert!(kind.is_call() || kind.is_return());
            }
        }
    }
});
