use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Slot index plus generation, shared by every arena-backed handle.
pub(crate) trait ArenaKey: Copy {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

macro_rules! generational_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl $name {
            /// Raw slot index, for diagnostics.
            #[inline]
            pub const fn index(self) -> u32 {
                self.index
            }

            #[inline]
            pub const fn generation(self) -> u32 {
                self.generation
            }
        }

        impl ArenaKey for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> u32 {
                self.index
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}@gen{})", stringify!($name), self.index, self.generation)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}@gen{}", self.index, self.generation)
            }
        }
    };
}

generational_id!(
    /// A handle to a node in a [`Scene`](crate::Scene).
    ///
    /// Destroying a node bumps its slot generation, so stale handles are
    /// rejected instead of aliasing whatever reuses the slot.
    NodeId
);

generational_id!(
    /// A handle to a [`BaseTexture`](crate::BaseTexture) in a [`TextureRegistry`](crate::TextureRegistry).
    BaseTextureId
);

generational_id!(
    /// A handle to a [`Texture`](crate::Texture) frame in a [`TextureRegistry`](crate::TextureRegistry).
    TextureId
);

/// Identifies one GPU context. Every backend instance gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(0);

impl ContextId {
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Identity of a [`Shader`](crate::Shader), used for batch-break comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub u64);

static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

impl ShaderId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_shows_index_and_generation() {
        let id = NodeId::from_parts(3, 1);
        assert_eq!(format!("{id:?}"), "NodeId(3@gen1)");
        assert_eq!(id.to_string(), "3@gen1");
    }

    #[test]
    fn context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
    }
}
