use candle_core::{Result, Tensor};

/// Closed-form KL divergence between N(μ, σ²) and N(0, τ²)
///
/// sum [ ln(τ/σ) + (σ² + μ²) / (2τ²) - 0.5 ]
///
/// Only for monitoring and testing; the training objective uses the
/// single-sample estimate log q(w) - log p(w).
///
/// * `mu` - variational mean
/// * `sigma` - variational standard deviation
/// * `tau` - prior scale
///
pub fn gaussian_kl_closed_form(mu: &Tensor, sigma: &Tensor, tau: f64) -> Result<Tensor> {
    let tau_sq = tau * tau;
    let log_ratio = sigma.log()?.affine(-1., tau.ln())?;
    let quad = ((sigma.sqr()? + mu.sqr()?)? / (2. * tau_sq))?;
    ((log_ratio + quad)? - 0.5)?.sum_all()
}

/// Mean binary cross entropy on logits
///
/// loss = mean[ max(x, 0) - x * y + log(1 + exp(-|x|)) ]
///
/// * `logits` - raw scores
/// * `targets` - labels in [0, 1], same shape as `logits`
///
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(logits.dtype())?;
    let log_term = (logits.abs()?.neg()?.exp()? + 1.)?.log()?;
    ((logits.relu()? - logits.mul(&targets)?)? + log_term)?.mean_all()
}

/// Mean squared error
///
/// * `pred` - predictions
/// * `targets` - observed values, same shape as `pred`
///
pub fn mse(pred: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(pred.dtype())?;
    candle_nn::loss::mse(pred, &targets)
}

/// Variational objective: task loss + β · KL
///
/// * `task_loss` - scalar data-fit term
/// * `kl` - scalar KL estimate summed over all Bayesian layers
/// * `kl_weight` - β, e.g. 1 / number of minibatches
///
pub fn variational_objective(task_loss: &Tensor, kl: &Tensor, kl_weight: f64) -> Result<Tensor> {
    task_loss + (kl * kl_weight)?
}
