//! floatradix — radix sort for f32 arrays, resident on the GPU.
//!
//! 32 single-bit stable-partition passes over the raw IEEE-754 bit patterns,
//! with placement offsets computed by a work-efficient hierarchical prefix
//! sum (2048-element blocks, recursive block-total aggregation), double
//! buffering between passes, and a final remap that fixes the ordering of
//! negative values.
//!
//! ```no_run
//! use floatradix::context::GpuContext;
//! use floatradix::sorter::FloatRadixSorter;
//!
//! let ctx = GpuContext::new()?;
//! let mut sorter = FloatRadixSorter::new(&ctx);
//! let sorted = sorter.sorted(&ctx, &[-5.0, 3.0, -1.0, 0.0, 2.0])?;
//! assert_eq!(sorted, vec![-5.0, -1.0, 0.0, 2.0, 3.0]);
//! # Ok::<(), floatradix::errors::SortError>(())
//! ```

pub mod context;
pub mod errors;
pub mod scan;
pub mod sorter;
