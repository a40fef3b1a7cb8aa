use rayon::prelude::*;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

use crate::ops::OpError;

/// Interpolate between `x0` and `x1` according to the `factor` in range [0, 1].
fn lerp(x0: f32, x1: f32, factor: f32) -> f32 {
    x0 + (x1 - x0) * factor
}

/// Compute `dest += src * scale` over rows of equal length.
fn add_scaled_row(dest: &mut [f32], src: &[f32], scale: f32) {
    assert!(src.len() == dest.len());
    for i in 0..dest.len() {
        dest[i] += src[i] * scale;
    }
}

/// Validate convolution hyperparameters and compute the output size for one
/// image using the standard formula
/// `out = (in + 2 * pad - dilation * (k - 1) - 1) / stride + 1`.
fn calc_output_size(
    in_hw: [usize; 2],
    kernel_hw: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    dilations: [usize; 2],
) -> Result<[usize; 2], OpError> {
    if kernel_hw.iter().any(|&k| k == 0) {
        return Err(OpError::InvalidValue("Kernel size must be > 0"));
    }
    if strides.iter().any(|&s| s == 0) {
        return Err(OpError::InvalidValue("Stride must be > 0"));
    }
    if dilations.iter().any(|&d| d == 0) {
        return Err(OpError::InvalidValue("Dilation must be > 0"));
    }

    let mut out_hw = [0; 2];
    for dim in 0..2 {
        let padded = in_hw[dim] + 2 * padding[dim];
        let dilated_kernel = dilations[dim] * (kernel_hw[dim] - 1) + 1;
        if padded < dilated_kernel {
            return Err(OpError::InvalidValue("Input too small for kernel size"));
        }
        out_hw[dim] = (padded - dilated_kernel) / strides[dim] + 1;
    }
    Ok(out_hw)
}

/// Unroll offset-displaced patches from an image into a column matrix.
///
/// `input` has shape [C,H,W] and `offset` has shape
/// [2 * offset_groups * Kh * Kw, Oh, Ow], where Kh/Kw are the kernel sizes
/// and Oh/Ow the output sizes. `columns` is the row-major data of a
/// [C * Kh * Kw, Oh * Ow] matrix; every element is written.
///
/// Each kernel tap of each output position samples the input at its regular
/// convolution coordinate displaced by the `(dy, dx)` pair that `offset`
/// holds for the tap. Sampling is bilinear, with out-of-bounds pixels read
/// as zero.
fn deform_im2col(
    columns: &mut [f32],
    input: NdTensorView<f32, 3>,
    offset: NdTensorView<f32, 3>,
    kernel_hw: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    dilations: [usize; 2],
    offset_groups: usize,
    out_hw: [usize; 2],
) {
    let [in_c, in_h, in_w] = input.shape();
    let [k_h, k_w] = kernel_hw;
    let [stride_h, stride_w] = strides;
    let [pad_top, pad_left] = padding;
    let [dilation_y, dilation_x] = dilations;
    let [out_h, out_w] = out_hw;

    let n_cols = out_h * out_w;
    let group_chans = in_c / offset_groups;
    let offset = offset.weakly_checked_view();

    for out_y in 0..out_h {
        for out_x in 0..out_w {
            let col = out_y * out_w + out_x;

            for group in 0..offset_groups {
                for k_y in 0..k_h {
                    for k_x in 0..k_w {
                        let tap = (group * k_h + k_y) * k_w + k_x;
                        let dy = offset[[2 * tap, out_y, out_x]];
                        let dx = offset[[2 * tap + 1, out_y, out_x]];

                        // Sample coordinates of this tap, which may be
                        // fractional or outside the input.
                        let y =
                            (out_y * stride_h + k_y * dilation_y) as f32 - pad_top as f32 + dy;
                        let x =
                            (out_x * stride_w + k_x * dilation_x) as f32 - pad_left as f32 + dx;

                        // Compute coordinates of the 4 pixels to sample and
                        // the interpolation factor along each axis.
                        let y_lerp = y - y.floor();
                        let in_y = y.floor() as i32;
                        let x_lerp = x - x.floor();
                        let in_x = x.floor() as i32;

                        for c in 0..group_chans {
                            let chan = group * group_chans + c;
                            let in_chan = input.slice(chan);

                            let get_pixel = |y: i32, x: i32| {
                                if y < 0 || y >= in_h as i32 || x < 0 || x >= in_w as i32 {
                                    // Out of bounds coordinates are sampled
                                    // as zero.
                                    0.
                                } else {
                                    // Safety: y and x are in-bounds here.
                                    unsafe { *in_chan.get_unchecked([y as usize, x as usize]) }
                                }
                            };

                            let y0x0 = get_pixel(in_y, in_x);
                            let y0x1 = get_pixel(in_y, in_x + 1);
                            let y1x0 = get_pixel(in_y + 1, in_x);
                            let y1x1 = get_pixel(in_y + 1, in_x + 1);
                            let y0 = lerp(y0x0, y0x1, x_lerp);
                            let y1 = lerp(y1x0, y1x1, x_lerp);
                            let val = lerp(y0, y1, y_lerp);

                            let row = (chan * k_h + k_y) * k_w + k_x;
                            columns[row * n_cols + col] = val;
                        }
                    }
                }
            }
        }
    }
}

/// Perform a deformable 2D convolution of `input` with `weight`, sampling
/// the input at per-tap positions displaced by `offset`.
///
/// `input` has dimensions NCHW, `weight` has OGHW where `G` is `C / groups`,
/// and `offset` has dimensions [N, 2 * offset_groups * Kh * Kw, Oh, Ow],
/// holding a `(dy, dx)` displacement pair per offset group, kernel tap and
/// output position. Oh/Ow must match the computed convolution output size.
///
/// - `bias` is an optional per-output-channel bias. A missing bias behaves
///   as zeros.
/// - `strides`, `padding` and `dilations` are [height, width] pairs.
///   `padding` is applied symmetrically to both sides of each axis.
/// - The weight group count is derived as `C / G` from the input and weight
///   shapes, and the offset group count from the offset channel count, as
///   `offset_channels / (2 * Kh * Kw)`. Both must divide the channel counts
///   they partition.
///
/// The result has dimensions [N, O, Oh, Ow].
pub fn deform_conv2d(
    input: NdTensorView<f32, 4>,
    offset: NdTensorView<f32, 4>,
    weight: NdTensorView<f32, 4>,
    bias: Option<NdTensorView<f32, 1>>,
    strides: [usize; 2],
    padding: [usize; 2],
    dilations: [usize; 2],
) -> Result<NdTensor<f32, 4>, OpError> {
    let [batch, in_c, in_h, in_w] = input.shape();
    let [out_c, k_in_c, k_h, k_w] = weight.shape();
    let [offset_batch, offset_c, offset_h, offset_w] = offset.shape();

    let [out_h, out_w] = calc_output_size([in_h, in_w], [k_h, k_w], strides, padding, dilations)?;

    if k_in_c == 0 || in_c % k_in_c != 0 {
        return Err(OpError::IncompatibleInputShapes(
            "Input channels (per group) of kernel must divide input channels",
        ));
    }
    let weight_groups = in_c / k_in_c;
    if out_c % weight_groups != 0 {
        return Err(OpError::IncompatibleInputShapes(
            "Output channels must be divisible by group count",
        ));
    }

    let tap_chans = 2 * k_h * k_w;
    if offset_c == 0 || offset_c % tap_chans != 0 {
        return Err(OpError::IncompatibleInputShapes(
            "Offset channels must be a non-zero multiple of 2 * kernel_h * kernel_w",
        ));
    }
    let offset_groups = offset_c / tap_chans;
    if in_c % offset_groups != 0 {
        return Err(OpError::IncompatibleInputShapes(
            "Input channels must be divisible by offset group count",
        ));
    }
    if offset_batch != batch {
        return Err(OpError::IncompatibleInputShapes(
            "Batch size of input and offset must match",
        ));
    }
    if [offset_h, offset_w] != [out_h, out_w] {
        return Err(OpError::IncompatibleInputShapes(
            "Spatial dims of offset must match convolution output size",
        ));
    }

    if let Some(bias) = bias {
        if bias.size(0) != out_c {
            return Err(OpError::IncompatibleInputShapes(
                "Bias length must match output channels",
            ));
        }
    }

    let mut output = NdTensor::zeros([batch, out_c, out_h, out_w]);

    let n_cols = out_h * out_w;
    let out_item_len = out_c * n_cols;

    // Rows of the kernel matrix must be contiguous for the per-group matrix
    // multiply below.
    let weight = weight.to_contiguous();
    let weight_data = weight.data().unwrap();

    // Number of column-matrix rows each weight group multiplies against.
    let k_mat = k_in_c * k_h * k_w;
    let out_chans_per_group = out_c / weight_groups;

    // The output was just allocated, so it is contiguous.
    let out_data = output.data_mut().unwrap();

    if out_item_len > 0 {
        out_data
            .par_chunks_mut(out_item_len)
            .enumerate()
            .for_each(|(n, out_item)| {
                let in_item = input.slice(n);
                let offset_item = offset.slice(n);

                // Image patches and the kernel are packed into matrices which
                // are then multiplied per group, with results accumulated into
                // the output. `deform_im2col` initializes every element.
                let mut columns = vec![0.; in_c * k_h * k_w * n_cols];
                deform_im2col(
                    &mut columns,
                    in_item,
                    offset_item,
                    [k_h, k_w],
                    strides,
                    padding,
                    dilations,
                    offset_groups,
                    [out_h, out_w],
                );

                if let Some(bias) = bias {
                    for chan in 0..out_c {
                        out_item[chan * n_cols..][..n_cols].fill(bias[[chan]]);
                    }
                }

                for chan in 0..out_c {
                    let group = chan / out_chans_per_group;
                    let kernel_row = &weight_data[chan * k_mat..][..k_mat];
                    let out_row = &mut out_item[chan * n_cols..][..n_cols];
                    let col_start = group * k_mat;

                    for (k, &kernel_val) in kernel_row.iter().enumerate() {
                        let col_row = &columns[(col_start + k) * n_cols..][..n_cols];
                        add_scaled_row(out_row, col_row, kernel_val);
                    }
                }
            });
    }

    Ok(output)
}
