//! Recoverable error types
//!
//! Precondition violations aren't represented here. They panic.
use core::fmt;

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $(
                $( #[doc $( $vdoc:tt )*] )*
                $Variant:ident => $message:literal,
            )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
        $vis enum $Name {
            $(
                $( #[doc $( $vdoc )*] )*
                $Variant,
            )*
        }

        impl fmt::Display for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(match self {
                    $( Self::$Variant => $message, )*
                })
            }
        }

        #[cfg(feature = "std")]
        impl std::error::Error for $Name {}
    };
}

define_error! {
    /// Error type for [`Kernel::thread_create`](crate::Kernel::thread_create).
    pub enum CreateThreadError {
        /// The port could not allocate a page for the thread.
        OutOfMemory => "out of memory for a new thread",
    }
}

define_error! {
    /// The operation was attempted in a context where it's not allowed, such
    /// as entering CPU Lock while it's already active.
    pub enum BadContextError {
        BadContext => "bad context",
    }
}
