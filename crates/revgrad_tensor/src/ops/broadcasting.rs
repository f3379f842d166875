use crate::Tensor;

/// Outcome of a best-effort broadcast.
#[derive(Debug, Clone)]
pub enum Expansion {
    Expanded(Tensor),
    NotExpanded,
}

impl Expansion {
    pub fn is_expanded(&self) -> bool {
        matches!(self, Self::Expanded(_))
    }

    pub fn into_expanded(self) -> Option<Tensor> {
        match self {
            Self::Expanded(t) => Some(t),
            Self::NotExpanded => None,
        }
    }
}

impl Tensor {
    /// Broadcasts to `shape` when the shapes are compatible.
    pub fn try_expand(&self, shape: &[usize]) -> Expansion {
        match self.layout().expand(shape) {
            Ok(layout) => Expansion::Expanded(self.with_layout(layout)),
            Err(_) => Expansion::NotExpanded,
        }
    }

    pub fn try_expand_as(&self, other: &Tensor) -> Expansion {
        self.try_expand(other.shape())
    }
}
