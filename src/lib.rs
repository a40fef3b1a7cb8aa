//! deform-conv implements deformable 2-D convolution ("Deformable
//! Convolutional Networks") for CPU execution on NCHW tensors.
//!
//! A deformable convolution is a standard 2D convolution where each kernel
//! tap additionally reads a learned, fractional `(dy, dx)` displacement from
//! an offset tensor and samples the input at the displaced location using
//! bilinear interpolation.
//!
//! # Usage
//!
//! The operator is exposed in two forms:
//!
//! 1. [`deform_conv2d`], a free function taking the input, offset, weight
//!    and optional bias tensors plus stride/padding/dilation pairs. Group
//!    counts are derived from the tensor shapes.
//! 2. [`DeformConv2d`], a layer which owns the weight and bias parameters.
//!    It is created via [`DeformConv2dConfig`], which validates the channel
//!    divisibility constraints and initializes the parameters
//!    (Kaiming-uniform weights, uniform bias).
//!
//! Tensors use the types from
//! [rten-tensor](https://docs.rs/rten-tensor/latest/rten_tensor/).
//!
//! ```
//! use deform_conv::DeformConv2dConfig;
//! use rten_tensor::prelude::*;
//! use rten_tensor::NdTensor;
//!
//! let conv = DeformConv2dConfig::new(2, 4, 3)
//!     .with_padding(1)
//!     .with_seed(1234)
//!     .init()
//!     .unwrap();
//!
//! let input = NdTensor::zeros([1, 2, 8, 8]);
//! // One offset group: 2 * 3 * 3 offset channels.
//! let offset = NdTensor::zeros([1, 18, 8, 8]);
//! let output = conv.forward(input.view(), offset.view()).unwrap();
//! assert_eq!(output.shape(), [1, 4, 8, 8]);
//! ```
//!
//! This crate implements the forward pass only. Gradients and training are
//! out of scope.

pub mod nn;
pub mod ops;

pub use nn::{DeformConv2d, DeformConv2dConfig};
pub use ops::{deform_conv2d, IntoPair, OpError};
