/// Adam hyperparameters
///
/// ### Fields
///
/// * `beta1` - Decay of the first moment estimate
/// * `beta2` - Decay of the second moment estimate
/// * `eps` - Added to the denominator for stability
#[derive(Clone, Debug)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Moment buffers for a single parameter group (one flat array of weights).
#[derive(Clone, Debug)]
struct MomentBuf {
    m: Vec<f64>,
    v: Vec<f64>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf {
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }
}

/// Adam optimiser over the assignment logits and the optional filter logits
///
/// Both groups share one step counter; they are always updated together.
#[derive(Clone, Debug)]
pub struct Adam {
    pub config: AdamConfig,
    logits: MomentBuf,
    filter: Option<MomentBuf>,
    step: u64,
}

/// Core Adam step on a single (params, grads, m, v) group.
///
/// Modifies params, m, v in place. Uses pre-computed bias correction inverses.
#[inline]
fn adam_step_buf(
    params: &mut [f64],
    grads: &[f64],
    buf: &mut MomentBuf,
    lr: f64,
    config: &AdamConfig,
    bc1_inv: f64,
    bc2_inv: f64,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        buf.m[i] = config.beta1 * buf.m[i] + (1.0 - config.beta1) * g;
        buf.v[i] = config.beta2 * buf.v[i] + (1.0 - config.beta2) * g * g;
        let m_hat = buf.m[i] * bc1_inv;
        let v_hat = buf.v[i] * bc2_inv;
        params[i] -= lr * m_hat / (v_hat.sqrt() + config.eps);
    }
}

impl Adam {
    /// Create optimiser state for the given parameter sizes
    ///
    /// ### Params
    ///
    /// * `n_logits` - Number of assignment logits
    /// * `n_filter` - Number of filter logits, if any
    /// * `config` - Adam hyperparameters
    ///
    /// ### Returns
    ///
    /// The `Adam` optimiser with zeroed moments.
    pub fn new(n_logits: usize, n_filter: Option<usize>, config: AdamConfig) -> Self {
        Adam {
            config,
            logits: MomentBuf::zeros(n_logits),
            filter: n_filter.map(MomentBuf::zeros),
            step: 0,
        }
    }

    /// Apply one update
    ///
    /// ### Params
    ///
    /// * `logits` - Assignment logits, updated in place
    /// * `logit_grads` - Gradient w.r.t. the assignment logits
    /// * `filter` - Optional filter logits, updated in place
    /// * `filter_grads` - Optional gradient w.r.t. the filter logits
    /// * `lr` - Learning rate
    pub fn step(
        &mut self,
        logits: &mut [f64],
        logit_grads: &[f64],
        filter: Option<&mut [f64]>,
        filter_grads: Option<&[f64]>,
        lr: f64,
    ) {
        self.step += 1;
        let t = self.step as f64;
        let bc1_inv = 1.0 / (1.0 - self.config.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - self.config.beta2.powf(t));

        adam_step_buf(
            logits,
            logit_grads,
            &mut self.logits,
            lr,
            &self.config,
            bc1_inv,
            bc2_inv,
        );

        if let (Some(p), Some(g), Some(buf)) = (filter, filter_grads, self.filter.as_mut()) {
            adam_step_buf(p, g, buf, lr, &self.config, bc1_inv, bc2_inv);
        }
    }
}
