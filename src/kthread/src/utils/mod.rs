//! Utility
mod prio_bitmap;
pub(crate) use self::prio_bitmap::PrioBitmap;
