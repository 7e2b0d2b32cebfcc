use std::fmt;
use crate::backend::Backend;

// A simple row-major tensor over f32 for testing. Unlike a real runtime
// tensor, slicing copies; the batching core does not care.
#[derive(Clone, Debug, PartialEq)]
pub struct MockTensor {
    pub(crate) shape: Vec<usize>,
    pub(crate) values: Vec<f32>,
}

impl MockTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            values.len(),
            "shape does not match value count"
        );
        Self { shape, values }
    }

    /// A rank-2 tensor from per-row value vectors; all rows must be equal width.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let values = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(vec![rows.len(), width], values)
    }

    /// A rank-1 tensor, one value per row.
    pub fn vector(values: &[f32]) -> Self {
        Self::new(vec![values.len()], values.to_vec())
    }

    /// A rank-0 tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self::new(vec![], vec![value])
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>().max(1)
    }
}

impl fmt::Display for MockTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockTensor({:?}, {:?})", self.shape, self.values)
    }
}

impl Backend for MockTensor {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn cat(tensors: &[Self], dim: usize) -> Self {
        assert_eq!(dim, 0, "mock tensor only concatenates along dim 0");
        assert!(!tensors.is_empty());
        let suffix = &tensors[0].shape[1..];
        let mut d0 = 0;
        let mut values = Vec::new();
        for t in tensors {
            assert_eq!(&t.shape[1..], suffix, "suffix shapes must agree");
            d0 += t.shape[0];
            values.extend_from_slice(&t.values);
        }
        let mut shape = tensors[0].shape.clone();
        shape[0] = d0;
        MockTensor::new(shape, values)
    }

    fn slice(&self, dim: usize, start: usize, len: usize) -> Self {
        assert_eq!(dim, 0, "mock tensor only slices along dim 0");
        assert!(start + len <= self.shape[0], "slice out of bounds");
        let width = self.row_width();
        let values = self.values[start * width..(start + len) * width].to_vec();
        let mut shape = self.shape.clone();
        shape[0] = len;
        MockTensor::new(shape, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_stacks_rows_in_order() {
        let a = MockTensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = MockTensor::from_rows(&[vec![5.0, 6.0]]);
        let c = MockTensor::cat(&[a, b], 0);
        assert_eq!(c.shape(), vec![3, 2]);
        assert_eq!(c.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn slice_extracts_rows() {
        let t = MockTensor::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]);
        let s = t.slice(0, 1, 2);
        assert_eq!(s.shape(), vec![2, 1]);
        assert_eq!(s.values(), &[2.0, 3.0]);
    }

    #[test]
    fn empty_slice_has_zero_rows() {
        let t = MockTensor::vector(&[1.0, 2.0]);
        let s = t.slice(0, 0, 0);
        assert_eq!(s.shape(), vec![0]);
        assert!(s.values().is_empty());
    }
}
