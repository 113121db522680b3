#![no_main]
use libfuzzer_sys::fuzz_target;
use gcpack::GroupCompressBlock;

fuzz_target!(|data: &[u8]| {
    if let Ok(block) = GroupCompressBlock::from_bytes(data) {
        for entry in block.entries() {
            let _ = block.extract(&entry.key);
        }
    }
});
