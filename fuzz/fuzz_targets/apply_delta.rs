#![no_main]
use libfuzzer_sys::fuzz_target;
use gcpack::apply_delta;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let split = data[0] as usize % data.len();
    let (source, body) = data[1..].split_at(split.min(data.len() - 1));
    let _ = apply_delta(source, body);
});
