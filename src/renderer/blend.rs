use crate::backend::{BlendFactor, BlendFunc};

/// How a node's premultiplied colour combines with what is already drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
}

impl BlendMode {
    /// Blend factor pair for premultiplied-alpha sources.
    pub fn func(self) -> BlendFunc {
        match self {
            Self::Normal => BlendFunc::new(BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
            Self::Add => BlendFunc::new(BlendFactor::One, BlendFactor::One),
            Self::Multiply => BlendFunc::new(BlendFactor::DstColor, BlendFactor::OneMinusSrcAlpha),
            Self::Screen => BlendFunc::new(BlendFactor::One, BlendFactor::OneMinusSrcColor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_to_distinct_factor_pairs() {
        let funcs = [
            BlendMode::Normal,
            BlendMode::Add,
            BlendMode::Multiply,
            BlendMode::Screen,
        ]
        .map(BlendMode::func);
        for (i, a) in funcs.iter().enumerate() {
            for b in &funcs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
