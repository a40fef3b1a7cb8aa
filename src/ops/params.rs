/// Conversion of scalar-or-pair hyperparameters into `[height, width]` pairs.
///
/// Convolution hyperparameters such as kernel size, stride, padding and
/// dilation are commonly given either as a single value applying to both
/// spatial axes or as an explicit (height, width) pair. This trait normalizes
/// both spellings; scalars broadcast to both axes.
pub trait IntoPair {
    /// Return the value as a `[height, width]` pair.
    fn into_pair(self) -> [usize; 2];
}

impl IntoPair for usize {
    fn into_pair(self) -> [usize; 2] {
        [self, self]
    }
}

impl IntoPair for [usize; 2] {
    fn into_pair(self) -> [usize; 2] {
        self
    }
}

impl IntoPair for (usize, usize) {
    fn into_pair(self) -> [usize; 2] {
        [self.0, self.1]
    }
}
