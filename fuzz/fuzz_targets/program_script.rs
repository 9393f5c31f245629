#![no_main]

use diverdown::engine::Engine;
use diverdown::script::Program;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Malformed programs are rejected, never panic
        if let Ok(program) = Program::from_json_str(input) {
            let engine = Engine::new();
            if let Ok(script) = program.install(&engine) {
                let _ = script.run(&engine);
            }
        }
    }
});
