#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowguard::{is_heap_corrupt, AccessMode, Parameters, Runtime};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Interprets a byte slice as a sequence of heap operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=free, 2=realloc, 3=diagnose)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers.
const MAX_SLOTS: usize = 64;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let params = Parameters::parse(
            "--shadow_window_size=67108864 --quarantine_size=262144 --sharding_factor=4",
        )
        .expect("fuzz options are valid");
        Runtime::new(params).expect("window can be mapped")
    })
}

fuzz_target!(|data: &[u8]| {
    let rt = runtime();
    let mut slots: [Option<(NonNull<u8>, usize)>; MAX_SLOTS] = [None; MAX_SLOTS];

    for op in data.chunks_exact(4) {
        let opcode = op[0] & 0x03;
        let size = u16::from_le_bytes([op[1], op[2]]) as usize;
        let slot = (op[3] as usize) % MAX_SLOTS;

        match opcode {
            0 => {
                if let Some((p, _)) = slots[slot].take() {
                    rt.free(p.as_ptr()).expect("live block frees cleanly");
                }
                let p = rt.allocate(size).expect("allocation fits the window");
                assert!(rt.shadow().is_range_accessible(p.as_ptr() as usize, size));
                unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAA, size.min(256)) };
                slots[slot] = Some((p, size));
            }
            1 => {
                if let Some((p, _)) = slots[slot].take() {
                    rt.free(p.as_ptr()).expect("live block frees cleanly");
                }
            }
            2 => {
                let old = slots[slot].take();
                let p = rt
                    .realloc(old.map(|(p, _)| p), size)
                    .expect("reallocation fits the window");
                if let Some((_, old_size)) = old {
                    let kept = old_size.min(size).min(256);
                    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), kept) };
                    assert!(bytes.iter().all(|&b| b == 0xAA));
                }
                unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAA, size.min(256)) };
                slots[slot] = Some((p, size));
            }
            3 => {
                if let Some((p, len)) = slots[slot] {
                    let e = rt.report_bad_access(p.as_ptr() as usize + len, AccessMode::Read, 1);
                    assert!(e.block.is_some());
                }
            }
            _ => unreachable!(),
        }
    }

    for (p, _) in slots.iter_mut().filter_map(Option::take) {
        rt.free(p.as_ptr()).expect("live block frees cleanly");
    }
    assert!(is_heap_corrupt(rt.shadow()).is_empty());
});
