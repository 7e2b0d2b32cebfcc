use crate::backend::Backend;
use crate::error::{BatchError, BatchResult};

/// Extent of dimension 0, the "size" of a tensor everywhere in this crate.
/// Rank-0 tensors have no dimension 0 and report 0.
pub(crate) fn leading_dim<B: Backend>(tensor: &B) -> usize {
    tensor.shape().first().copied().unwrap_or(0)
}

pub(crate) fn num_elements<B: Backend>(tensor: &B) -> usize {
    tensor.shape().iter().product()
}

/// A tensor with the same suffix shape but zero rows.
pub(crate) fn empty_like<B: Backend>(tensor: &B) -> B {
    tensor.slice(0, 0, 0)
}

/// Concatenate `tensors` along dimension 0.
///
/// All inputs must have the same rank and agree on every dimension except
/// dimension 0, mirroring what a device concat kernel would accept.
pub(crate) fn concat_rows<B: Backend>(tensors: &[B]) -> BatchResult<B> {
    let first = tensors.first().ok_or_else(|| {
        BatchError::InvalidArgument("cannot concatenate an empty list of tensors".to_string())
    })?;
    let first_shape = first.shape();
    for (i, tensor) in tensors.iter().enumerate().skip(1) {
        let shape = tensor.shape();
        if shape.len() != first_shape.len() {
            return Err(BatchError::InvalidArgument(format!(
                "ranks of all input tensors should match: shape[0] = {:?} vs. shape[{}] = {:?}",
                first_shape, i, shape
            )));
        }
        if shape[1..] != first_shape[1..] {
            return Err(BatchError::InvalidArgument(format!(
                "dimensions of inputs should match: shape[0] = {:?} vs. shape[{}] = {:?}",
                first_shape, i, shape
            )));
        }
    }
    Ok(B::cat(tensors, 0))
}

/// Split `tensor` along dimension 0 into `sizes.len()` tensors, the i-th
/// having `sizes[i]` rows. The sizes must not overrun the input.
pub(crate) fn split_rows<B: Backend>(tensor: &B, sizes: &[usize]) -> BatchResult<Vec<B>> {
    let total: usize = sizes.iter().sum();
    if total > leading_dim(tensor) {
        return Err(BatchError::InvalidArgument(
            "sum of split sizes must not exceed dim0-size of input tensor".to_string(),
        ));
    }
    let mut outputs = Vec::with_capacity(sizes.len());
    let mut position = 0;
    for &size in sizes {
        outputs.push(tensor.slice(0, position, size));
        position += size;
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_tensor::MockTensor;

    #[test]
    fn split_then_concat_is_identity() {
        let t = MockTensor::from_rows(&[vec![1.0], vec![2.0], vec![3.0], vec![4.0]]);
        let parts = split_rows(&t, &[1, 2, 1]).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].values(), &[2.0, 3.0]);
        let back = concat_rows(&parts).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn split_rejects_oversized_size_vector() {
        let t = MockTensor::vector(&[1.0, 2.0]);
        let err = split_rows(&t, &[2, 1]).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[test]
    fn concat_rejects_mismatched_suffix() {
        let a = MockTensor::from_rows(&[vec![1.0, 2.0]]);
        let b = MockTensor::from_rows(&[vec![1.0, 2.0, 3.0]]);
        let err = concat_rows(&[a, b]).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[test]
    fn empty_like_preserves_suffix_shape() {
        let t = MockTensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let e = empty_like(&t);
        assert_eq!(e.shape(), vec![0, 2]);
    }

    #[test]
    fn leading_dim_of_rank_zero_is_zero() {
        let t = MockTensor::scalar(7.0);
        assert_eq!(leading_dim(&t), 0);
        assert_eq!(num_elements(&t), 1);
    }
}
