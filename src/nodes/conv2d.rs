use crate::backend::{ConvGeometry, Device};
use crate::error::{NetError, Result};
use crate::nodes::conf::Conv2dConf;
use crate::nodes::{expect_shape, Node, NodeKind, Param};
use crate::tensor::{Backend, Shape, TensorHandle};

struct Forward<D: Device> {
    geometry: ConvGeometry,
    input: Shape,
    cols: D::Array,
    /// Activation output before sparsification.
    activated: D::Array,
    mask: Option<D::Array>,
    /// What the layer emitted, feeds the competitive rule.
    output: D::Array,
}

/// 2d convolution with optional k-winners-take-all and CPCA.
///
/// Forward order is convolution, activation, kWTA. An update takes the gradient
/// step first and then adds the competitive weight change on top.
pub struct Conv2d<D: Device> {
    conf: Conv2dConf,
    seed: u64,
    weights: Option<(Param<D>, Param<D>)>,
    forward: Option<Forward<D>>,
}

impl<D: Device> Conv2d<D> {
    pub fn new(conf: Conv2dConf, seed: u64) -> Result<Self> {
        conf.validate()?;
        Ok(Conv2d {
            conf,
            seed,
            weights: None,
            forward: None,
        })
    }

    pub fn conf(&self) -> &Conv2dConf {
        &self.conf
    }

    fn geometry(&self, input: &Shape) -> Result<ConvGeometry> {
        let g = ConvGeometry::new(input, self.conf.filters, self.conf.kernel, self.conf.stride, self.conf.padding)?;
        if let Some((w, _)) = &self.weights {
            if w.shape[1] != g.channels {
                return Err(NetError::mismatch("Conv2d", format!("{} input channels", w.shape[1]), input));
            }
        }
        Ok(g)
    }

    /// Creates the parameters once the number of input channels is known.
    fn materialise(&mut self, g: &ConvGeometry) -> Result<()> {
        if self.weights.is_none() {
            let [kh, kw] = self.conf.kernel;
            let w = Param::init(
                &g.weight_dims(),
                self.conf.init,
                g.patch_len(),
                g.filters * kh * kw,
                self.seed,
            )?;
            let b = Param::zeros(&[g.filters])?;
            tracing::trace!(weights = %w.shape, "Conv2d parameters materialised");
            self.weights = Some((w, b));
        }
        Ok(())
    }
}

impl<D: Device> Node for Conv2d<D> {
    fn kind(&self) -> NodeKind {
        NodeKind::Conv2d
    }

    fn backend(&self) -> Backend {
        D::BACKEND
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        Shape::new(&self.geometry(input)?.output_dims())
    }

    fn activation(&mut self, training: bool, x: &TensorHandle) -> Result<TensorHandle> {
        self.forward = None;
        let input = D::view(x)?;
        let g = self.geometry(x.shape())?;
        self.materialise(&g)?;
        let Some((w, b)) = &self.weights else {
            return Err(NetError::IllegalState("Conv2d parameters missing".into()));
        };

        let cols = D::im2col(input, &g)?;
        let z = D::conv_forward(&cols, &w.value, &b.value, &g)?;
        let activated = D::activate(&z, self.conf.af)?;
        let (output, mask) = if self.conf.k > 0 {
            let (sparse, mask) = D::kwta(&activated, self.conf.k, &g)?;
            (sparse, Some(mask))
        } else {
            (activated.clone(), None)
        };

        let shape = Shape::new(&g.output_dims())?;
        if training {
            self.forward = Some(Forward {
                geometry: g,
                input: x.shape().clone(),
                cols,
                activated,
                mask,
                output: output.clone(),
            });
        }
        Ok(D::handle(shape, output))
    }

    fn update(&mut self, learning_rate: f64, grad: &TensorHandle) -> Result<TensorHandle> {
        let state = self.forward.take().ok_or_else(|| NetError::no_forward_state("Conv2d"))?;
        let g = state.geometry;
        expect_shape("Conv2d gradient", &Shape::new(&g.output_dims())?, grad.shape())?;
        let grad = D::view(grad)?;
        let Some((w, b)) = self.weights.as_mut() else {
            return Err(NetError::no_forward_state("Conv2d"));
        };

        let grad = match &state.mask {
            Some(mask) => D::mul(grad, mask),
            None => grad.clone(),
        };
        let grad = D::activate_backward(&state.activated, &grad, self.conf.af)?;
        let (dx, dw, db) = D::conv_backward(&state.cols, &w.value, &grad, &g)?;
        w.step(learning_rate, &dw);
        b.step(learning_rate, &db);

        if self.conf.ratio > 0.0 {
            let delta = D::cpca(&state.cols, &state.output, &w.value, &g)?;
            D::axpy(&mut w.value, self.conf.ratio as f32, &delta);
        }
        Ok(D::handle(state.input, dx))
    }

    fn parameters(&self) -> Result<Vec<TensorHandle>> {
        match &self.weights {
            Some((w, b)) => Ok(vec![w.to_host()?, b.to_host()?]),
            None => Ok(Vec::new()),
        }
    }
}
