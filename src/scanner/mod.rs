pub mod index;
pub mod walk;

pub use index::{diff, language_for, ChangedFile, ScanDelta};
pub use walk::{walk_roots, DiskStamp};
