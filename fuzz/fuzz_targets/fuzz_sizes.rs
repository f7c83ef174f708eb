#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowguard::block::user_pointer_to_block_info;
use shadowguard::{Parameters, Runtime};
use std::sync::OnceLock;

// Exercises block geometry. Input is a series of (size, alignment_shift)
// records; every block must be aligned, addressable across its body, fenced
// by redzones, and resolvable back to its own header.

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let params = Parameters::parse("--shadow_window_size=134217728 --quarantine_size=0")
            .expect("fuzz options are valid");
        Runtime::new(params).expect("window can be mapped")
    })
}

fuzz_target!(|data: &[u8]| {
    let rt = runtime();
    let shadow = rt.shadow();
    for record in data.chunks_exact(5) {
        let raw_size = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let size = (raw_size as usize) % (1024 * 1024);
        let align = 1usize << (record[4] % 13);

        let p = rt.allocate_aligned(size, align).expect("allocation fits the window");
        let addr = p.as_ptr() as usize;
        assert_eq!(addr % align, 0, "{size}-byte block misaligned for {align}");
        assert!(shadow.is_range_accessible(addr, size));
        assert!(!shadow.is_accessible(addr - 1));
        assert!(!shadow.is_accessible(addr + size));
        assert_eq!(shadow.find_first_poisoned_byte(addr, size + 1), Some(addr + size));

        let info = user_pointer_to_block_info(shadow, addr).expect("block resolves");
        assert_eq!(info.body, addr);
        assert_eq!(info.body_size, size);
        assert!(info.block <= addr && addr + size <= info.end());

        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xBB, size) };
        rt.free(p.as_ptr()).expect("live block frees cleanly");
    }
});
