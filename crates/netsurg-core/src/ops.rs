//! Operation kinds and weight-bearing operations.
//!
//! [`OpKind`] is the closed vocabulary of operation kinds the graph model
//! understands. Each variant carries its configuration record (unit or filter
//! count, kernel size, data layout, ...). An [`Operation`] pairs a kind with a
//! name and its weight tensors.
//!
//! # Weight layout
//!
//! Weight tensors follow one fixed layout per kind, independent of the data
//! layout of the activations flowing through the graph:
//! - `Dense`: kernel `[input_units, units]`, optional bias `[units]`
//! - `Conv2D`: kernel `[kh, kw, in_channels, filters]`, optional bias `[filters]`
//!
//! All other kinds are weightless.
//!
//! # Shape inference
//!
//! Output shapes exclude the batch dimension and are computed per application
//! by [`Operation::output_shape`], so a shared operation applied at two points
//! of a graph may produce different spatial extents.

use ndarray::{Array1, Array2, Array4, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Element-wise activation fused into an operation or applied standalone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationFn {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

/// Spatial padding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Padding {
    /// No padding; windows must fit entirely inside the input.
    #[default]
    Valid,
    /// Pad so that `output = ceil(input / stride)`.
    Same,
}

/// Position of the channel axis in a spatial activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataFormat {
    /// `[height, width, channels]`
    #[default]
    ChannelsLast,
    /// `[channels, height, width]`
    ChannelsFirst,
}

impl DataFormat {
    /// Splits a rank-3 shape into `(height, width, channels)`.
    fn split(self, shape: &[usize]) -> (usize, usize, usize) {
        match self {
            DataFormat::ChannelsLast => (shape[0], shape[1], shape[2]),
            DataFormat::ChannelsFirst => (shape[1], shape[2], shape[0]),
        }
    }

    /// Joins `(height, width, channels)` back into a rank-3 shape.
    fn join(self, h: usize, w: usize, c: usize) -> Vec<usize> {
        match self {
            DataFormat::ChannelsLast => vec![h, w, c],
            DataFormat::ChannelsFirst => vec![c, h, w],
        }
    }
}

/// Spatial options shared by [`Operation::conv2d`] callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConvOptions {
    pub strides: [usize; 2],
    pub padding: Padding,
    pub data_format: DataFormat,
    pub activation: ActivationFn,
}

impl ConvOptions {
    /// Unit strides, valid padding, channels-last, no activation.
    pub fn new() -> Self {
        ConvOptions {
            strides: [1, 1],
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// The closed set of operation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// A declared graph input producing a tensor of `shape`.
    Input { shape: Vec<usize> },

    /// Fully-connected layer over a 1-D input.
    Dense {
        units: usize,
        input_units: usize,
        use_bias: bool,
        activation: ActivationFn,
    },

    /// 2-D spatial convolution.
    Conv2D {
        filters: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        data_format: DataFormat,
        use_bias: bool,
        activation: ActivationFn,
    },

    /// 2-D max pooling.
    MaxPool2D {
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        data_format: DataFormat,
    },

    /// Flattens its input to 1-D in row-major order.
    Flatten,

    /// Standalone element-wise activation.
    Activation { function: ActivationFn },

    /// Element-wise sum of two or more equally shaped inputs.
    Add,
}

impl OpKind {
    /// Returns the kind's name, e.g. `"Dense"`.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "Input",
            OpKind::Dense { .. } => "Dense",
            OpKind::Conv2D { .. } => "Conv2D",
            OpKind::MaxPool2D { .. } => "MaxPool2D",
            OpKind::Flatten => "Flatten",
            OpKind::Activation { .. } => "Activation",
            OpKind::Add => "Add",
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A named operation with its configuration and weights.
///
/// Once placed in a graph an operation is never mutated in place; edits build
/// new `Operation` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OpKind,
    pub weights: Vec<ArrayD<f32>>,
}

impl Operation {
    /// Builds an operation from its parts, checking the weights against the
    /// kind's configuration.
    pub fn from_parts(
        name: impl Into<String>,
        kind: OpKind,
        weights: Vec<ArrayD<f32>>,
    ) -> Result<Self, CoreError> {
        let op = Operation {
            name: name.into(),
            kind,
            weights,
        };
        op.validate_weights()?;
        Ok(op)
    }

    /// A graph input of the given shape (batch dimension excluded).
    pub fn input(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Operation {
            name: name.into(),
            kind: OpKind::Input { shape },
            weights: Vec::new(),
        }
    }

    /// A dense layer from a `[input_units, units]` kernel and optional bias.
    pub fn dense(
        name: impl Into<String>,
        kernel: Array2<f32>,
        bias: Option<Array1<f32>>,
        activation: ActivationFn,
    ) -> Result<Self, CoreError> {
        let (input_units, units) = kernel.dim();
        let mut weights = vec![kernel.into_dyn()];
        if let Some(b) = &bias {
            weights.push(b.clone().into_dyn());
        }
        Operation::from_parts(
            name,
            OpKind::Dense {
                units,
                input_units,
                use_bias: bias.is_some(),
                activation,
            },
            weights,
        )
    }

    /// A 2-D convolution from a `[kh, kw, in_channels, filters]` kernel.
    pub fn conv2d(
        name: impl Into<String>,
        kernel: Array4<f32>,
        bias: Option<Array1<f32>>,
        options: ConvOptions,
    ) -> Result<Self, CoreError> {
        let (kh, kw, _, filters) = kernel.dim();
        let mut weights = vec![kernel.into_dyn()];
        if let Some(b) = &bias {
            weights.push(b.clone().into_dyn());
        }
        Operation::from_parts(
            name,
            OpKind::Conv2D {
                filters,
                kernel_size: [kh, kw],
                strides: options.strides,
                padding: options.padding,
                data_format: options.data_format,
                use_bias: bias.is_some(),
                activation: options.activation,
            },
            weights,
        )
    }

    /// Max pooling with strides equal to the pool size.
    pub fn max_pool2d(
        name: impl Into<String>,
        pool_size: [usize; 2],
        data_format: DataFormat,
    ) -> Self {
        Operation {
            name: name.into(),
            kind: OpKind::MaxPool2D {
                pool_size,
                strides: pool_size,
                padding: Padding::Valid,
                data_format,
            },
            weights: Vec::new(),
        }
    }

    pub fn flatten(name: impl Into<String>) -> Self {
        Operation {
            name: name.into(),
            kind: OpKind::Flatten,
            weights: Vec::new(),
        }
    }

    pub fn activation(name: impl Into<String>, function: ActivationFn) -> Self {
        Operation {
            name: name.into(),
            kind: OpKind::Activation { function },
            weights: Vec::new(),
        }
    }

    pub fn add(name: impl Into<String>) -> Self {
        Operation {
            name: name.into(),
            kind: OpKind::Add,
            weights: Vec::new(),
        }
    }

    /// Returns the kind's name, e.g. `"Conv2D"`.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Returns `true` for declared graph inputs.
    pub fn is_input(&self) -> bool {
        matches!(self.kind, OpKind::Input { .. })
    }

    /// The kernel weight tensor, for weight-bearing kinds.
    pub fn kernel(&self) -> Option<&ArrayD<f32>> {
        self.weights.first()
    }

    /// The bias weight tensor, when the kind uses one.
    pub fn bias(&self) -> Option<&ArrayD<f32>> {
        self.weights.get(1)
    }

    /// Number of output channels (units for `Dense`, filters for `Conv2D`).
    ///
    /// `None` for kinds without a channel-count configuration field.
    pub fn channel_count(&self) -> Option<usize> {
        match self.kind {
            OpKind::Dense { units, .. } => Some(units),
            OpKind::Conv2D { filters, .. } => Some(filters),
            _ => None,
        }
    }

    /// Axis of the channel dimension in this operation's output of rank `rank`.
    pub fn channel_axis(&self, rank: usize) -> usize {
        match self.kind {
            OpKind::Conv2D {
                data_format: DataFormat::ChannelsFirst,
                ..
            }
            | OpKind::MaxPool2D {
                data_format: DataFormat::ChannelsFirst,
                ..
            } => 0,
            _ => rank.saturating_sub(1),
        }
    }

    /// Checks that the weight tensors agree with the kind's configuration.
    pub fn validate_weights(&self) -> Result<(), CoreError> {
        match &self.kind {
            OpKind::Dense {
                units,
                input_units,
                use_bias,
                ..
            } => {
                self.expect_weight_count(1 + usize::from(*use_bias))?;
                self.expect_weight_shape(0, &[*input_units, *units])?;
                if *use_bias {
                    self.expect_weight_shape(1, &[*units])?;
                }
                Ok(())
            }
            OpKind::Conv2D {
                filters,
                kernel_size,
                use_bias,
                ..
            } => {
                self.expect_weight_count(1 + usize::from(*use_bias))?;
                let kernel = &self.weights[0];
                let shape = kernel.shape();
                if shape.len() != 4
                    || shape[0] != kernel_size[0]
                    || shape[1] != kernel_size[1]
                    || shape[3] != *filters
                {
                    return Err(self.shape_error(format!(
                        "kernel shape {:?} does not match kernel_size {:?} and {} filters",
                        shape, kernel_size, filters
                    )));
                }
                if *use_bias {
                    self.expect_weight_shape(1, &[*filters])?;
                }
                Ok(())
            }
            _ => self.expect_weight_count(0),
        }
    }

    /// Infers the output shape of one application of this operation.
    pub fn output_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>, CoreError> {
        match &self.kind {
            OpKind::Input { shape } => {
                self.expect_arity(inputs, 0)?;
                Ok(shape.clone())
            }
            OpKind::Dense {
                units, input_units, ..
            } => {
                self.expect_arity(inputs, 1)?;
                let input = inputs[0];
                if input.len() != 1 || input[0] != *input_units {
                    return Err(self.shape_error(format!(
                        "expected input of shape [{}], got {:?}",
                        input_units, input
                    )));
                }
                Ok(vec![*units])
            }
            OpKind::Conv2D {
                filters,
                kernel_size,
                strides,
                padding,
                data_format,
                ..
            } => {
                self.expect_arity(inputs, 1)?;
                let input = inputs[0];
                self.expect_rank(input, 3)?;
                let (h, w, c) = data_format.split(input);
                let in_channels = self
                    .kernel()
                    .and_then(|k| k.shape().get(2).copied())
                    .ok_or_else(|| self.shape_error("missing convolution kernel".to_string()))?;
                if c != in_channels {
                    return Err(self.shape_error(format!(
                        "kernel expects {} input channels, input {:?} has {}",
                        in_channels, input, c
                    )));
                }
                let oh = self.window_extent(h, kernel_size[0], strides[0], *padding)?;
                let ow = self.window_extent(w, kernel_size[1], strides[1], *padding)?;
                Ok(data_format.join(oh, ow, *filters))
            }
            OpKind::MaxPool2D {
                pool_size,
                strides,
                padding,
                data_format,
            } => {
                self.expect_arity(inputs, 1)?;
                let input = inputs[0];
                self.expect_rank(input, 3)?;
                let (h, w, c) = data_format.split(input);
                let oh = self.window_extent(h, pool_size[0], strides[0], *padding)?;
                let ow = self.window_extent(w, pool_size[1], strides[1], *padding)?;
                Ok(data_format.join(oh, ow, c))
            }
            OpKind::Flatten => {
                self.expect_arity(inputs, 1)?;
                Ok(vec![inputs[0].iter().product()])
            }
            OpKind::Activation { .. } => {
                self.expect_arity(inputs, 1)?;
                Ok(inputs[0].to_vec())
            }
            OpKind::Add => {
                if inputs.len() < 2 {
                    return Err(CoreError::ArityMismatch {
                        op: self.name.clone(),
                        expected: 2,
                        got: inputs.len(),
                    });
                }
                let first = inputs[0];
                if let Some(other) = inputs.iter().find(|s| **s != first) {
                    return Err(self.shape_error(format!(
                        "cannot add shapes {:?} and {:?}",
                        first, other
                    )));
                }
                Ok(first.to_vec())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn shape_error(&self, reason: String) -> CoreError {
        CoreError::ShapeMismatch {
            op: self.name.clone(),
            reason,
        }
    }

    fn expect_arity(&self, inputs: &[&[usize]], expected: usize) -> Result<(), CoreError> {
        if inputs.len() != expected {
            return Err(CoreError::ArityMismatch {
                op: self.name.clone(),
                expected,
                got: inputs.len(),
            });
        }
        Ok(())
    }

    fn expect_rank(&self, shape: &[usize], rank: usize) -> Result<(), CoreError> {
        if shape.len() != rank {
            return Err(self.shape_error(format!(
                "expected rank-{} input, got {:?}",
                rank, shape
            )));
        }
        Ok(())
    }

    fn expect_weight_count(&self, expected: usize) -> Result<(), CoreError> {
        if self.weights.len() != expected {
            return Err(self.shape_error(format!(
                "expected {} weight tensor(s), got {}",
                expected,
                self.weights.len()
            )));
        }
        Ok(())
    }

    fn expect_weight_shape(&self, index: usize, expected: &[usize]) -> Result<(), CoreError> {
        let got = self.weights[index].shape();
        if got != expected {
            return Err(self.shape_error(format!(
                "weight {} has shape {:?}, expected {:?}",
                index, got, expected
            )));
        }
        Ok(())
    }

    fn window_extent(
        &self,
        size: usize,
        window: usize,
        stride: usize,
        padding: Padding,
    ) -> Result<usize, CoreError> {
        if stride == 0 {
            return Err(self.shape_error("stride must be positive".to_string()));
        }
        match padding {
            Padding::Same => Ok(size.div_ceil(stride)),
            Padding::Valid => {
                if size < window {
                    return Err(self.shape_error(format!(
                        "window {} does not fit input extent {}",
                        window, size
                    )));
                }
                Ok((size - window) / stride + 1)
            }
        }
    }
}
