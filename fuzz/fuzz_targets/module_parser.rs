#![no_main]

use libfuzzer_sys::fuzz_target;
use racewatch::config::InstrumentationConfig;
use racewatch::ir::Module;
use racewatch::pass::InstrumentationPass;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    // Parsing must never panic, and any module that validates must
    // instrument without panicking
    if let Ok(module) = Module::from_json_str(input) {
        let mut pass = InstrumentationPass::new(InstrumentationConfig::default());
        let _ = pass.run_on_module(&module);
    }
});
