//! Layer wrapper which owns the learnable parameters of a deformable
//! convolution.

use fastrand::Rng;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView, NdTensorViewMut};

use crate::ops::{deform_conv2d, IntoPair, OpError};

/// Configuration for a [`DeformConv2d`] layer.
///
/// Hyperparameters accepting `impl IntoPair` take either a scalar, which
/// applies to both spatial axes, or an explicit `[height, width]` pair.
#[derive(Clone, Debug)]
pub struct DeformConv2dConfig {
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    dilations: [usize; 2],
    groups: usize,
    offset_groups: usize,
    bias: bool,
    seed: Option<u64>,
}

impl DeformConv2dConfig {
    /// Create a configuration with stride 1, no padding, dilation 1, a
    /// single weight and offset group, and a bias.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: impl IntoPair,
    ) -> DeformConv2dConfig {
        DeformConv2dConfig {
            in_channels,
            out_channels,
            kernel_size: kernel_size.into_pair(),
            strides: [1, 1],
            padding: [0, 0],
            dilations: [1, 1],
            groups: 1,
            offset_groups: 1,
            bias: true,
            seed: None,
        }
    }

    /// Set the distance between convolution centers.
    pub fn with_stride(mut self, stride: impl IntoPair) -> Self {
        self.strides = stride.into_pair();
        self
    }

    /// Set the implicit zero padding added to both sides of each spatial
    /// axis.
    pub fn with_padding(mut self, padding: impl IntoPair) -> Self {
        self.padding = padding.into_pair();
        self
    }

    /// Set the spacing between kernel elements.
    pub fn with_dilation(mut self, dilation: impl IntoPair) -> Self {
        self.dilations = dilation.into_pair();
        self
    }

    /// Set the number of groups the input and output channels are split
    /// into for convolution.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Set the number of groups the input channels are split into for
    /// offset sampling. Each offset group has its own displacements per
    /// kernel tap and output position.
    pub fn with_offset_groups(mut self, offset_groups: usize) -> Self {
        self.offset_groups = offset_groups;
        self
    }

    /// Enable or disable the learnable bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Set the seed used to initialize parameters. Layers created with the
    /// same configuration and seed have identical parameters. If unset, the
    /// seed comes from entropy.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration and create a layer with freshly
    /// initialized parameters.
    ///
    /// Weights are drawn from a Kaiming-uniform distribution with slope
    /// parameter √5 and the bias from a uniform distribution bounded by
    /// 1/√fan_in, matching the common initialization for convolution
    /// layers. Validation errors are raised before any parameters are
    /// allocated.
    pub fn init(&self) -> Result<DeformConv2d, OpError> {
        if self.groups == 0 || self.offset_groups == 0 {
            return Err(OpError::InvalidValue("Group counts must be > 0"));
        }
        if self.in_channels % self.groups != 0 {
            return Err(OpError::InvalidValue(
                "in_channels must be divisible by groups",
            ));
        }
        if self.in_channels % self.offset_groups != 0 {
            return Err(OpError::InvalidValue(
                "in_channels must be divisible by offset_groups",
            ));
        }
        if self.out_channels % self.groups != 0 {
            return Err(OpError::InvalidValue(
                "out_channels must be divisible by groups",
            ));
        }

        let [k_h, k_w] = self.kernel_size;
        let fan_in = (self.in_channels / self.groups) * k_h * k_w;
        if fan_in == 0 {
            return Err(OpError::InvalidValue(
                "in_channels and kernel size must be > 0",
            ));
        }

        let mut rng = match self.seed {
            Some(seed) => Rng::with_seed(seed),
            None => Rng::new(),
        };

        fn uniform(rng: &mut Rng, bound: f32) -> f32 {
            bound * (rng.f32() * 2. - 1.)
        }

        // Kaiming-uniform with slope a = √5: the bound is
        // √3 * gain / √fan_in with gain = √(2 / (1 + a²)), which reduces
        // to 1 / √fan_in. The bias uses the same fan-in derived bound.
        let bound = 1. / (fan_in as f32).sqrt();

        let weight_shape = [self.out_channels, self.in_channels / self.groups, k_h, k_w];
        let weight_data: Vec<f32> = (0..weight_shape.iter().product::<usize>())
            .map(|_| uniform(&mut rng, bound))
            .collect();
        let weight = NdTensor::from_data(weight_shape, weight_data);

        let bias = self.bias.then(|| {
            let bias_data: Vec<f32> = (0..self.out_channels)
                .map(|_| uniform(&mut rng, bound))
                .collect();
            NdTensor::from_data([self.out_channels], bias_data)
        });

        Ok(DeformConv2d {
            weight,
            bias,
            strides: self.strides,
            padding: self.padding,
            dilations: self.dilations,
        })
    }
}

/// Deformable 2D convolution layer.
///
/// The layer owns the weight and optional bias parameters. [`forward`]
/// (DeformConv2d::forward) runs [`deform_conv2d`] with the held parameters.
#[derive(Debug)]
pub struct DeformConv2d {
    weight: NdTensor<f32, 4>,
    bias: Option<NdTensor<f32, 1>>,
    strides: [usize; 2],
    padding: [usize; 2],
    dilations: [usize; 2],
}

impl DeformConv2d {
    /// Run the convolution over `input` using the per-tap displacements
    /// from `offset`.
    ///
    /// `input` has dimensions NCHW and `offset` has dimensions
    /// [N, 2 * offset_groups * Kh * Kw, Oh, Ow]. Shape mismatches propagate
    /// as errors from [`deform_conv2d`].
    pub fn forward(
        &self,
        input: NdTensorView<f32, 4>,
        offset: NdTensorView<f32, 4>,
    ) -> Result<NdTensor<f32, 4>, OpError> {
        deform_conv2d(
            input,
            offset,
            self.weight.view(),
            self.bias.as_ref().map(|b| b.view()),
            self.strides,
            self.padding,
            self.dilations,
        )
    }

    /// Return the weight, of shape [out_channels, in_channels / groups,
    /// Kh, Kw].
    pub fn weight(&self) -> NdTensorView<f32, 4> {
        self.weight.view()
    }

    /// Return a mutable view of the weight, for in-place updates by an
    /// optimizer.
    pub fn weight_mut(&mut self) -> NdTensorViewMut<f32, 4> {
        self.weight.view_mut()
    }

    /// Return the bias, if the layer has one.
    pub fn bias(&self) -> Option<NdTensorView<f32, 1>> {
        self.bias.as_ref().map(|b| b.view())
    }

    /// Return a mutable view of the bias, if the layer has one.
    pub fn bias_mut(&mut self) -> Option<NdTensorViewMut<f32, 1>> {
        self.bias.as_mut().map(|b| b.view_mut())
    }
}

#[cfg(test)]
mod tests {
    use deform_conv_testing::TestCases;
    use rten_tensor::prelude::*;
    use rten_tensor::rng::XorShiftRng;
    use rten_tensor::test_util::expect_equal;
    use rten_tensor::NdTensor;

    use super::DeformConv2dConfig;
    use crate::ops::{deform_conv2d, OpError};

    #[test]
    fn test_init_group_combinations() {
        #[derive(Debug)]
        struct Case {
            in_channels: usize,
            out_channels: usize,
            groups: usize,
            offset_groups: usize,
            expected: Result<(), OpError>,
        }

        let cases = [
            Case {
                in_channels: 4,
                out_channels: 4,
                groups: 1,
                offset_groups: 1,
                expected: Ok(()),
            },
            Case {
                in_channels: 4,
                out_channels: 6,
                groups: 2,
                offset_groups: 4,
                expected: Ok(()),
            },
            Case {
                in_channels: 4,
                out_channels: 4,
                groups: 3,
                offset_groups: 1,
                expected: Err(OpError::InvalidValue(
                    "in_channels must be divisible by groups",
                )),
            },
            Case {
                in_channels: 4,
                out_channels: 4,
                groups: 1,
                offset_groups: 3,
                expected: Err(OpError::InvalidValue(
                    "in_channels must be divisible by offset_groups",
                )),
            },
            Case {
                in_channels: 4,
                out_channels: 5,
                groups: 2,
                offset_groups: 1,
                expected: Err(OpError::InvalidValue(
                    "out_channels must be divisible by groups",
                )),
            },
            Case {
                in_channels: 4,
                out_channels: 4,
                groups: 0,
                offset_groups: 1,
                expected: Err(OpError::InvalidValue("Group counts must be > 0")),
            },
        ];

        cases.test_each(|case| {
            let result = DeformConv2dConfig::new(case.in_channels, case.out_channels, 3)
                .with_groups(case.groups)
                .with_offset_groups(case.offset_groups)
                .init();
            match (&case.expected, result) {
                (Ok(()), Ok(conv)) => {
                    assert_eq!(
                        conv.weight().shape(),
                        [
                            case.out_channels,
                            case.in_channels / case.groups,
                            3,
                            3
                        ]
                    );
                }
                (Err(expected), result) => {
                    assert_eq!(result.err().as_ref(), Some(expected));
                }
                (Ok(()), Err(err)) => panic!("expected success but got {:?}", err),
            }
        });
    }

    /// Scalar hyperparameters broadcast to both spatial axes.
    #[test]
    fn test_scalar_params_normalize_to_pairs() {
        let conv = DeformConv2dConfig::new(2, 2, 3)
            .with_stride(2)
            .with_padding(1)
            .with_seed(1234)
            .init()
            .unwrap();
        assert_eq!(conv.weight().shape(), [2, 2, 3, 3]);

        let input = NdTensor::zeros([1, 2, 5, 5]);
        // out = (5 + 2 * 1 - 3) / 2 + 1 = 3 along both axes.
        let offset = NdTensor::zeros([1, 18, 3, 3]);
        let output = conv.forward(input.view(), offset.view()).unwrap();
        assert_eq!(output.shape(), [1, 2, 3, 3]);
    }

    #[test]
    fn test_init_bounds_and_seed() {
        let config = DeformConv2dConfig::new(4, 4, 3).with_seed(1234);
        let conv = config.init().unwrap();
        let again = config.init().unwrap();

        // fan_in = (4 / 1) * 3 * 3.
        let bound = 1. / (36f32).sqrt();
        for w in conv.weight().iter() {
            assert!(w.abs() <= bound);
        }
        for b in conv.bias().unwrap().iter() {
            assert!(b.abs() <= bound);
        }

        // Not all values collapse to a constant.
        let first = conv.weight().iter().next().copied().unwrap();
        assert!(conv.weight().iter().any(|&w| w != first));

        // Same seed, same parameters.
        let conv_weight: NdTensor<f32, 4> = conv.weight().to_tensor();
        let again_weight: NdTensor<f32, 4> = again.weight().to_tensor();
        expect_equal(&conv_weight, &again_weight).unwrap();
    }

    #[test]
    fn test_forward_matches_functional() {
        let conv = DeformConv2dConfig::new(2, 4, 3)
            .with_padding(1)
            .with_seed(1234)
            .init()
            .unwrap();

        let mut rng = XorShiftRng::new(99);
        let input = NdTensor::rand([1, 2, 6, 6], &mut rng);
        let offset_data: Vec<f32> = (0..18 * 36).map(|_| rng.next_f32() - 0.5).collect();
        let offset = NdTensor::from_data([1, 18, 6, 6], offset_data);

        let layer_result = conv.forward(input.view(), offset.view()).unwrap();
        let fn_result = deform_conv2d(
            input.view(),
            offset.view(),
            conv.weight(),
            conv.bias(),
            [1, 1],
            [1, 1],
            [1, 1],
        )
        .unwrap();

        expect_equal(&layer_result, &fn_result).unwrap();
    }

    /// A layer without bias behaves like one whose bias is all zeros.
    #[test]
    fn test_no_bias() {
        let conv = DeformConv2dConfig::new(2, 2, 3)
            .with_bias(false)
            .with_seed(1234)
            .init()
            .unwrap();
        assert!(conv.bias().is_none());

        let mut rng = XorShiftRng::new(99);
        let input = NdTensor::rand([1, 2, 4, 4], &mut rng);
        let offset = NdTensor::zeros([1, 18, 2, 2]);

        let no_bias = conv.forward(input.view(), offset.view()).unwrap();
        let zero_bias = NdTensor::zeros([2]);
        let explicit = deform_conv2d(
            input.view(),
            offset.view(),
            conv.weight(),
            Some(zero_bias.view()),
            [1, 1],
            [0, 0],
            [1, 1],
        )
        .unwrap();

        expect_equal(&no_bias, &explicit).unwrap();
    }

    /// Parameters can be updated in place through the mutable accessors.
    #[test]
    fn test_param_update() {
        let mut conv = DeformConv2dConfig::new(1, 1, 1).with_seed(1234).init().unwrap();

        conv.weight_mut().iter_mut().for_each(|w| *w = 3.);
        conv.bias_mut().unwrap().iter_mut().for_each(|b| *b = 1.);

        let input = NdTensor::from_data([1, 1, 1, 1], vec![2.]);
        let offset = NdTensor::zeros([1, 2, 1, 1]);
        let output = conv.forward(input.view(), offset.view()).unwrap();
        assert_eq!(output[[0, 0, 0, 0]], 7.);
    }
}
