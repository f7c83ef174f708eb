/// Largest request served from a size-class free list. Bigger chunks are
/// page-granular.
pub const SMALL_THRESHOLD: usize = 16384;

/// 4-per-doubling size classes:
///
/// 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256,
/// 320, 384, 448, 512, 640, 768, 896, 1024, 1280, 1536, 1792, 2048,
/// 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192,
/// 10240, 12288, 14336, 16384
pub const NUM_SIZE_CLASSES: usize = 36;

pub static SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = {
    let mut table = [0usize; NUM_SIZE_CLASSES];
    let mut idx = 0;

    let mut base = 0;
    while idx < 4 {
        base += 16;
        table[idx] = base;
        idx += 1;
    }

    while idx < NUM_SIZE_CLASSES {
        let step = base / 4;
        let mut j = 0;
        while j < 4 && idx < NUM_SIZE_CLASSES {
            base += step;
            table[idx] = base;
            idx += 1;
            j += 1;
        }
    }

    table
};

/// Smallest class holding `size` bytes, or `None` above [`SMALL_THRESHOLD`].
#[inline]
pub fn size_class_index(size: usize) -> Option<usize> {
    if size > SMALL_THRESHOLD {
        return None;
    }
    Some(SIZE_CLASSES.partition_point(|&class| class < size))
}

#[inline]
pub fn slot_size(class_index: usize) -> usize {
    SIZE_CLASSES[class_index]
}
