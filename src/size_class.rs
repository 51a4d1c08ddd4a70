//! Size-class schedule: maps allocation sizes to class ids and back.
//!
//! The schedule is a spline of five order-1 polynomials. The first class
//! has size `BREAKS[0]`; classes then grow by `STEPS[0]` until `BREAKS[1]`,
//! by `STEPS[1]` until `BREAKS[2]`, and so on. Steps are powers of two so
//! the conversions compile to shifts, and the whole schedule is plain const
//! arithmetic that folds away on the hot path.

/// A spline size-class schedule.
///
/// Implementors provide the six breakpoints, five steps and five per-class
/// cache budgets; everything else is derived. `validate()` rejects
/// schedules that break the layout assumptions and is called once when a
/// size-class allocator is constructed.
pub trait SizeClassMap: 'static {
    /// Spline breakpoints `l0 < l1 < … < l5`. `l0` is the smallest class
    /// size, `l5` the largest.
    const BREAKS: [usize; 6];
    /// Step between consecutive classes within each bracket. Powers of two.
    const STEPS: [usize; 5];
    /// Per-bracket cache run budget: how many blocks of a class a thread
    /// cache transfers to and from the back end at a time.
    const CACHED: [usize; 5];

    /// Cumulative class count at each breakpoint.
    const U0: usize = (Self::BREAKS[1] - Self::BREAKS[0]) / Self::STEPS[0];
    const U1: usize = Self::U0 + (Self::BREAKS[2] - Self::BREAKS[1]) / Self::STEPS[1];
    const U2: usize = Self::U1 + (Self::BREAKS[3] - Self::BREAKS[2]) / Self::STEPS[2];
    const U3: usize = Self::U2 + (Self::BREAKS[4] - Self::BREAKS[3]) / Self::STEPS[3];
    const U4: usize = Self::U3 + (Self::BREAKS[5] - Self::BREAKS[4]) / Self::STEPS[4];

    /// Number of classes. Must be a power of two and at most 256.
    const NUM_CLASSES: usize = Self::U4 + 1;
    const MIN_SIZE: usize = Self::BREAKS[0];
    const MAX_SIZE: usize = Self::BREAKS[5];

    /// Block size of class `class`. Strictly increasing in `class`.
    #[inline]
    fn size_of(class: usize) -> usize {
        debug_assert!(class < Self::NUM_CLASSES, "class {class} out of range");
        if class <= Self::U0 {
            return Self::BREAKS[0] + Self::STEPS[0] * class;
        }
        if class <= Self::U1 {
            return Self::BREAKS[1] + Self::STEPS[1] * (class - Self::U0);
        }
        if class <= Self::U2 {
            return Self::BREAKS[2] + Self::STEPS[2] * (class - Self::U1);
        }
        if class <= Self::U3 {
            return Self::BREAKS[3] + Self::STEPS[3] * (class - Self::U2);
        }
        Self::BREAKS[4] + Self::STEPS[4] * (class - Self::U3)
    }

    /// Smallest class whose size is at least `size` (rounds up).
    ///
    /// Callers must keep `size` in `[1, MAX_SIZE]`; larger sizes are not
    /// representable and belong to the large-object allocator.
    #[inline]
    fn class_of(size: usize) -> usize {
        debug_assert!(
            size >= 1 && size <= Self::MAX_SIZE,
            "size {size} has no class"
        );
        if size <= Self::BREAKS[1] {
            // Sizes below the first breakpoint all land in class 0; the
            // saturating subtraction keeps the closed form from wrapping.
            return (size.saturating_sub(Self::BREAKS[0]) + Self::STEPS[0] - 1) / Self::STEPS[0];
        }
        if size <= Self::BREAKS[2] {
            return Self::U0 + (size - Self::BREAKS[1] + Self::STEPS[1] - 1) / Self::STEPS[1];
        }
        if size <= Self::BREAKS[3] {
            return Self::U1 + (size - Self::BREAKS[2] + Self::STEPS[2] - 1) / Self::STEPS[2];
        }
        if size <= Self::BREAKS[4] {
            return Self::U2 + (size - Self::BREAKS[3] + Self::STEPS[3] - 1) / Self::STEPS[3];
        }
        Self::U3 + (size - Self::BREAKS[4] + Self::STEPS[4] - 1) / Self::STEPS[4]
    }

    /// Run budget for class `class`: the most blocks a thread cache holds
    /// for that class before draining half back to the back end.
    #[inline]
    fn max_cached(class: usize) -> usize {
        debug_assert!(class < Self::NUM_CLASSES, "class {class} out of range");
        if class <= Self::U0 {
            return Self::CACHED[0];
        }
        if class <= Self::U1 {
            return Self::CACHED[1];
        }
        if class <= Self::U2 {
            return Self::CACHED[2];
        }
        if class <= Self::U3 {
            return Self::CACHED[3];
        }
        Self::CACHED[4]
    }

    /// Panic if the schedule violates the layout assumptions. Called once
    /// at allocator construction.
    fn validate() {
        assert!(
            Self::NUM_CLASSES.is_power_of_two() && Self::NUM_CLASSES <= 256,
            "class count {} must be a power of two <= 256",
            Self::NUM_CLASSES
        );
        assert!(
            Self::MAX_SIZE.is_power_of_two(),
            "largest class size {} must be a power of two",
            Self::MAX_SIZE
        );
        assert!(
            Self::MIN_SIZE >= std::mem::size_of::<usize>(),
            "smallest class size {} cannot hold a free-list link",
            Self::MIN_SIZE
        );
        for i in 0..5 {
            assert!(
                Self::STEPS[i].is_power_of_two(),
                "step {} is not a power of two",
                Self::STEPS[i]
            );
            assert!(
                Self::BREAKS[i] < Self::BREAKS[i + 1],
                "breakpoints must be strictly increasing"
            );
            assert!(
                (Self::BREAKS[i + 1] - Self::BREAKS[i]).is_multiple_of(Self::STEPS[i]),
                "bracket {i} is not a whole number of steps"
            );
            assert!(Self::CACHED[i] >= 1, "cache budget of bracket {i} is zero");
        }
    }
}

/// The production schedule: 256 classes, 16-byte granularity at the small
/// end, 2 MiB largest class.
pub struct DefaultSizeClassMap;

impl SizeClassMap for DefaultSizeClassMap {
    const BREAKS: [usize; 6] = [1 << 4, 1 << 9, 1 << 12, 1 << 15, 1 << 18, 1 << 21];
    const STEPS: [usize; 5] = [1 << 4, 1 << 6, 1 << 9, 1 << 12, 1 << 15];
    const CACHED: [usize; 5] = [256, 64, 16, 4, 1];
}

/// A small-footprint schedule: at most 32 classes, 32 KiB largest class.
/// Useful where address space or metadata overhead is at a premium.
pub struct CompactSizeClassMap;

impl SizeClassMap for CompactSizeClassMap {
    const BREAKS: [usize; 6] = [1 << 3, 1 << 4, 1 << 7, 1 << 8, 1 << 12, 1 << 15];
    const STEPS: [usize; 5] = [1 << 3, 1 << 4, 1 << 7, 1 << 8, 1 << 12];
    const CACHED: [usize; 5] = [256, 64, 16, 4, 1];
}

const _: () = assert!(DefaultSizeClassMap::NUM_CLASSES == 256);
const _: () = assert!(CompactSizeClassMap::NUM_CLASSES <= 32);
