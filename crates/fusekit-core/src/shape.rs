use smallvec::SmallVec;
use std::fmt;

/// Tensor shape, stack-allocated for up to six dimensions.
///
/// Packed QKV tensors are rank 5 (`[batch, seqlen, 3, heads, head_dim]`),
/// so the inline capacity is larger than a plain matrix library needs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 6]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (rank 0).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for a scalar).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major strides in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 6]> {
        let mut strides: SmallVec<[usize; 6]> = SmallVec::from_elem(1, self.dims.len());
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Shape with `axis` removed.
    pub fn without_axis(&self, axis: usize) -> Option<Shape> {
        if axis >= self.ndim() {
            return None;
        }
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Some(Shape { dims })
    }

    /// Whether `suffix` equals the trailing dimensions of this shape.
    pub fn ends_with(&self, suffix: &[usize]) -> bool {
        suffix.len() <= self.ndim() && self.dims[self.ndim() - suffix.len()..] == *suffix
    }

    /// Split the element count into `(rows, row_len)` where a row spans the
    /// trailing `trailing_rank` dimensions.
    pub fn rows_and_cols(&self, trailing_rank: usize) -> Option<(usize, usize)> {
        if trailing_rank > self.ndim() {
            return None;
        }
        let split = self.ndim() - trailing_rank;
        let rows = self.dims[..split].iter().product();
        let cols = self.dims[split..].iter().product();
        Some((rows, cols))
    }

    /// Validate a reshape target. At most one `-1` entry is inferred.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred = None;
        let mut known: usize = 1;
        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d >= 0 => known = known.checked_mul(d as usize)?,
                _ => return None,
            }
        }
        let mut dims: SmallVec<[usize; 6]> =
            target.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(idx) = inferred {
            if known == 0 || numel % known != 0 {
                return None;
            }
            dims[idx] = numel / known;
        }
        let shape = Shape { dims };
        (shape.numel() == numel).then_some(shape)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_rank5() {
        let s = Shape::new(&[2, 4, 3, 2, 8]);
        assert_eq!(s.contiguous_strides().as_slice(), &[192, 48, 16, 8, 1]);
        assert_eq!(s.numel(), 384);
    }

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert!(s.is_scalar());
        assert_eq!(s.numel(), 1);
        assert!(s.contiguous_strides().is_empty());
    }

    #[test]
    fn test_without_axis() {
        let s = Shape::new(&[6, 3, 2, 4]);
        assert_eq!(s.without_axis(1).unwrap().dims(), &[6, 2, 4]);
        assert!(s.without_axis(4).is_none());
    }

    #[test]
    fn test_suffix_and_rows() {
        let s = Shape::new(&[2, 5, 5]);
        assert!(s.ends_with(&[5]));
        assert!(s.ends_with(&[5, 5]));
        assert!(!s.ends_with(&[2, 5]));
        assert!(s.ends_with(&[]));
        assert_eq!(s.rows_and_cols(1), Some((10, 5)));
        assert_eq!(s.rows_and_cols(2), Some((2, 25)));
        assert_eq!(s.rows_and_cols(4), None);
    }

    #[test]
    fn test_reshape() {
        let s = Shape::new(&[2, 3, 4]);
        assert_eq!(s.resolve_reshape(&[-1, 4]).unwrap().dims(), &[6, 4]);
        assert!(s.resolve_reshape(&[-1, -1]).is_none());
        assert!(s.resolve_reshape(&[5, 5]).is_none());
    }
}
