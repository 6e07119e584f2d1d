//! Neural Network inference.

use std::{ops::RangeInclusive, path::Path, sync::Arc};

use anyhow::{bail, Context};
use tract_onnx::prelude::{
    tract_ndarray::Array4, tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TVec,
    Tensor, TypedFact, TypedOp,
};

use crate::image::{Rect, Resolution, RgbFrame};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A convolutional neural network (CNN) that operates on image data.
///
/// Like the underlying [`NeuralNetwork`], this is a cheaply [`Clone`]able handle to the underlying
/// data.
#[derive(Clone)]
pub struct Cnn {
    nn: NeuralNetwork,
    shape: CnnInputShape,
    input_res: Resolution,
    color_mapper: ColorMapper,
}

impl Cnn {
    /// Creates a CNN wrapper from a [`NeuralNetwork`].
    ///
    /// The network must have exactly one input, with either an NCHW or an NHWC shape holding 3
    /// color channels. Which one is used is determined from the input shape.
    pub fn new(nn: NeuralNetwork, color_mapper: ColorMapper) -> anyhow::Result<Self> {
        if nn.num_inputs() != 1 {
            bail!(
                "CNN network has to take exactly 1 input, this one takes {}",
                nn.num_inputs(),
            );
        }

        let tensor_shape = nn
            .input_shape(0)
            .context("CNN input has a symbolic shape")?;
        let (shape, w, h) = match tensor_shape {
            [1, 3, h, w] => (CnnInputShape::NCHW, *w, *h),
            [1, h, w, 3] => (CnnInputShape::NHWC, *w, *h),
            _ => bail!("invalid model input shape for CNN: {:?}", tensor_shape),
        };

        let (w, h): (u32, u32) = (w.try_into()?, h.try_into()?);
        Ok(Self {
            nn,
            shape,
            input_res: Resolution::new(w, h),
            color_mapper,
        })
    }

    /// Returns the expected input image size.
    #[inline]
    pub fn input_resolution(&self) -> Resolution {
        self.input_res
    }

    #[inline]
    pub fn input_shape(&self) -> CnnInputShape {
        self.shape
    }

    /// Runs the network on the `region` of `frame`, returning the estimated outputs.
    ///
    /// `region` is given in frame pixels and is sampled to create the network's input tensor. If
    /// its aspect ratio does not match the network's input aspect ratio, it will be stretched.
    /// Parts of `region` outside of the frame are black.
    pub fn estimate(&self, frame: &RgbFrame, region: Rect) -> anyhow::Result<Outputs> {
        let tensor = frame_to_tensor(
            frame,
            region,
            self.shape,
            self.input_res,
            &self.color_mapper,
        );
        self.nn.estimate(tensor)
    }
}

/// Samples `region` of `frame` into a tensor of size `res` (nearest neighbor).
fn frame_to_tensor(
    frame: &RgbFrame,
    region: Rect,
    shape: CnnInputShape,
    res: Resolution,
    color_mapper: &ColorMapper,
) -> Tensor {
    let (h, w) = (res.height() as usize, res.width() as usize);
    let (frame_w, frame_h) = (frame.width() as f32, frame.height() as f32);
    let sample = |x: usize, y: usize| {
        let fx = (region.x() + (x as f32 + 0.5) / w as f32 * region.width()).floor();
        let fy = (region.y() + (y as f32 + 0.5) / h as f32 * region.height()).floor();
        if (0.0..frame_w).contains(&fx) && (0.0..frame_h).contains(&fy) {
            color_mapper.map(frame.rgb(fx as u32, fy as u32))
        } else {
            color_mapper.map([0, 0, 0])
        }
    };

    match shape {
        CnnInputShape::NCHW => {
            Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| sample(x, y)[c]).into()
        }
        CnnInputShape::NHWC => {
            Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| sample(x, y)[c]).into()
        }
    }
}

/// Maps 8-bit sRGB values to the value range a network expects.
#[derive(Debug, Clone)]
pub struct ColorMapper {
    target_range: RangeInclusive<f32>,
}

impl ColorMapper {
    /// Creates a simple color mapper that uniformly maps sRGB values to `target_range`.
    ///
    /// Note that this operates on *non-linear* sRGB colors, but maps them linearly to the target
    /// range.
    pub fn linear(target_range: RangeInclusive<f32>) -> Self {
        assert!(target_range.end() > target_range.start());
        Self { target_range }
    }

    fn map(&self, rgb: [u8; 3]) -> [f32; 3] {
        let start = *self.target_range.start();
        let end = *self.target_range.end();

        let adjust_range = (end - start) / 255.0;
        rgb.map(|col| col as f32 * adjust_range + start)
    }
}

/// Describes in what order a CNN expects its input image data.
///
/// - `N` is the number of images, often fixed at 1.
/// - `C` is the number of color channels, often 3 for RGB inputs.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnnInputShape {
    /// Shape is `[N, C, H, W]`.
    NCHW,
    /// Shape is `[N, H, W, C]`.
    NHWC,
}

/// Neural network loader.
pub struct Loader {
    model_data: Vec<u8>,
    outputs: Option<Vec<usize>>,
}

impl Loader {
    /// Only compute the specified outputs during inference.
    ///
    /// This takes a list of [`usize`]s corresponding to network output indices. When called, the
    /// [`Outputs`] returned from [`NeuralNetwork::estimate`] will only contain the chosen output
    /// tensors, in the given order.
    pub fn with_output_selection<O>(mut self, outputs: O) -> Self
    where
        O: Into<Vec<usize>>,
    {
        self.outputs = Some(outputs.into());
        self
    }

    /// Loads and optimizes the network.
    ///
    /// Returns an error if the network data is malformed, if the network data is incomplete, or if
    /// the network uses unimplemented operations.
    pub fn load(self) -> anyhow::Result<NeuralNetwork> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*self.model_data)?
            .into_optimized()?;
        let outputs = graph.output_outlets()?;
        let selected_outputs = match self.outputs {
            Some(indices) => indices
                .iter()
                .map(|&i| {
                    outputs.get(i).copied().with_context(|| {
                        format!("network has no output #{i} ({} outputs)", outputs.len())
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => outputs.to_vec(),
        };
        let model = SimplePlan::new_for_outputs(graph, &selected_outputs)?;

        Ok(NeuralNetwork(Arc::new(model)))
    }
}

/// A neural network that can be used for inference.
///
/// This is a cheaply [`Clone`]able handle to the underlying network structures.
#[derive(Clone)]
pub struct NeuralNetwork(Arc<Model>);

impl NeuralNetwork {
    /// Reads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension. The returned [`Loader`] finishes loading.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Loader> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl(path: &Path) -> anyhow::Result<Loader> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!("neural network file must have `.onnx` extension"),
        }

        let model_data = std::fs::read(path)
            .with_context(|| format!("failed to read model '{}'", path.display()))?;
        Ok(Self::from_onnx(model_data))
    }

    /// Reads a pre-trained model from an in-memory ONNX file.
    pub fn from_onnx(raw: impl Into<Vec<u8>>) -> Loader {
        Loader {
            model_data: raw.into(),
            outputs: None,
        }
    }

    /// Returns the number of input nodes of the network.
    pub fn num_inputs(&self) -> usize {
        self.0.model().inputs.len()
    }

    /// Returns the tensor shape of input `id`, or [`None`] if it is not fully known.
    pub fn input_shape(&self, id: usize) -> Option<&[usize]> {
        let fact = self.0.model().input_fact(id).ok()?;
        fact.shape.as_concrete()
    }

    /// Runs the network on a single input tensor, returning the estimated [`Outputs`].
    #[doc(alias = "infer")]
    pub fn estimate(&self, input: Tensor) -> anyhow::Result<Outputs> {
        let outputs = self.0.run(tvec![TValue::from_const(Arc::new(input))])?;
        Ok(Outputs { inner: outputs })
    }
}

/// The result of a neural network inference pass.
///
/// This is a list of tensors corresponding to the network's output nodes.
#[derive(Debug)]
pub struct Outputs {
    inner: TVec<TValue>,
}

impl Outputs {
    /// Returns the data of output tensor `index` as a flat `f32` slice.
    pub fn f32_slice(&self, index: usize) -> anyhow::Result<&[f32]> {
        let tensor = self
            .inner
            .get(index)
            .with_context(|| format!("network output #{index} is missing"))?;
        Ok(tensor.as_slice::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::image::{Color, Image};

    use super::*;

    #[test]
    fn color_mapper() {
        let mapper = ColorMapper::linear(-1.0..=1.0);
        assert_eq!(mapper.map([0, 0, 0]), [-1.0, -1.0, -1.0]);
        assert_eq!(mapper.map([255, 255, 255]), [1.0, 1.0, 1.0]);

        let mapper = ColorMapper::linear(0.0..=1.0);
        assert_eq!(mapper.map([0, 255, 0]), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn tensor_layout() {
        // Left half red, right half green.
        let mut image = Image::filled(4, 2, Color::RED);
        for y in 0..2 {
            image.set(2, y, Color::GREEN);
            image.set(3, y, Color::GREEN);
        }
        let frame = image.to_rgb();
        let whole = Rect::from_top_left(0.0, 0.0, 4.0, 2.0);
        let mapper = ColorMapper::linear(0.0..=1.0);
        let res = Resolution::new(2, 1);

        let nchw = frame_to_tensor(&frame, whole, CnnInputShape::NCHW, res, &mapper);
        assert_eq!(nchw.shape(), &[1, 3, 1, 2]);
        // Channel-major: R of both pixels, then G, then B.
        assert_eq!(
            nchw.as_slice::<f32>().unwrap(),
            &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );

        let nhwc = frame_to_tensor(&frame, whole, CnnInputShape::NHWC, res, &mapper);
        assert_eq!(nhwc.shape(), &[1, 1, 2, 3]);
        assert_eq!(
            nhwc.as_slice::<f32>().unwrap(),
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn region_outside_frame_is_black() {
        let frame = Image::filled(4, 2, Color::WHITE).to_rgb();
        let mapper = ColorMapper::linear(-1.0..=1.0);
        let res = Resolution::new(2, 1);

        // The left sample falls at x = -2, the right one at x = 2.
        let region = Rect::from_top_left(-4.0, 0.0, 8.0, 2.0);
        let tensor = frame_to_tensor(&frame, region, CnnInputShape::NHWC, res, &mapper);
        assert_eq!(
            tensor.as_slice::<f32>().unwrap(),
            &[-1.0, -1.0, -1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn rejects_non_onnx_path() {
        let err = NeuralNetwork::from_path("model.tflite").err().unwrap();
        assert!(err.to_string().contains(".onnx"));
    }
}
