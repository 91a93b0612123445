//! Running moments, autocorrelation and effective sample size.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::VecDeque;

/// Largest autocorrelation lag tracked by [`RunningStatistics`] unless configured otherwise.
pub const DEFAULT_MAX_LAG: usize = 256;

/**
Online accumulator of mean, covariance and lagged autocovariances.

Mean and covariance follow Welford's update. For the effective sample size the
accumulator keeps lagged cross-product sums up to `max_lag` together with the
first and last `max_lag` samples, so an update costs `O(dim * max_lag)` no
matter how long the chain runs and the sample history is never stored.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RunningStatistics {
    n: usize,
    mean: DVector<f64>,
    m2: DMatrix<f64>,
    max_lag: usize,
    sum: DVector<f64>,
    head: Vec<DVector<f64>>,
    tail: VecDeque<DVector<f64>>,
    lag_products: Vec<DVector<f64>>,
}

impl RunningStatistics {
    pub fn new(dim: usize) -> Self {
        Self::with_max_lag(dim, DEFAULT_MAX_LAG)
    }

    pub fn with_max_lag(dim: usize, max_lag: usize) -> Self {
        Self {
            n: 0,
            mean: DVector::zeros(dim),
            m2: DMatrix::zeros(dim, dim),
            max_lag,
            sum: DVector::zeros(dim),
            head: Vec::with_capacity(max_lag),
            tail: VecDeque::with_capacity(max_lag + 1),
            lag_products: vec![DVector::zeros(dim); max_lag + 1],
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn count(&self) -> usize {
        self.n
    }

    /// Adds one sample.
    pub fn update(&mut self, x: &DVector<f64>) {
        self.n += 1;
        let delta = x - &self.mean;
        self.mean += &delta / self.n as f64;
        let delta2 = x - &self.mean;
        self.m2 += &delta * delta2.transpose();

        self.lag_products[0] += x.component_mul(x);
        for lag in 1..=self.tail.len().min(self.max_lag) {
            let earlier = &self.tail[self.tail.len() - lag];
            self.lag_products[lag] += x.component_mul(earlier);
        }
        self.sum += x;
        if self.head.len() < self.max_lag {
            self.head.push(x.clone());
        }
        self.tail.push_back(x.clone());
        if self.tail.len() > self.max_lag {
            self.tail.pop_front();
        }
    }

    /// Sample mean; zero before the first update.
    pub fn mean(&self) -> DVector<f64> {
        self.mean.clone()
    }

    /// Unbiased sample covariance; zero until two samples have been seen.
    pub fn covariance(&self) -> DMatrix<f64> {
        if self.n < 2 {
            return DMatrix::zeros(self.dim(), self.dim());
        }
        &self.m2 / (self.n - 1) as f64
    }

    /// Autocovariance of dimension `d` at `lag` (biased, `1/n` normalization).
    fn autocovariance(&self, d: usize, lag: usize) -> f64 {
        let n = self.n;
        let mu = self.mean[d];
        let head_sum: f64 = self.head[..lag].iter().map(|x| x[d]).sum();
        let tail_sum: f64 = self.tail.iter().rev().take(lag).map(|x| x[d]).sum();
        let leading = self.sum[d] - head_sum;
        let trailing = self.sum[d] - tail_sum;
        (self.lag_products[lag][d] - mu * (leading + trailing) + (n - lag) as f64 * mu * mu)
            / n as f64
    }

    /// Autocorrelation of dimension `d` for lags `0..=max_lag` (clipped to the sample count).
    pub fn autocorrelation(&self, d: usize) -> Vec<f64> {
        if self.n == 0 {
            return Vec::new();
        }
        let max = self.max_lag.min(self.n - 1);
        let gamma0 = self.autocovariance(d, 0);
        (0..=max)
            .map(|lag| {
                if gamma0 > 0.0 {
                    self.autocovariance(d, lag) / gamma0
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Effective sample size per dimension, computed on demand.
    pub fn effective_sample_size(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|d| ess_from_autocorrelation(self.n, &self.autocorrelation(d))),
        )
    }
}

/**
Effective sample size `n / (1 + 2 sum_{lag > 0} rho(lag))`, summing until the
first negative autocorrelation.

A chain with zero variance counts as a single independent draw.
*/
pub fn ess_from_autocorrelation(n: usize, rho: &[f64]) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if rho.is_empty() || rho[0] <= 0.0 {
        return 1.0;
    }
    let tau = 1.0
        + 2.0
            * rho[1..]
                .iter()
                .take_while(|r| **r >= 0.0)
                .sum::<f64>();
    n as f64 / tau
}

/// Normalized autocorrelation of `series` for every lag, computed with an FFT.
pub fn autocorrelation(series: ArrayView1<f64>) -> Array1<f64> {
    let n = series.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mean = series.mean().unwrap_or(0.0);
    let fft_len = (2 * n).next_power_of_two();
    let mut buffer: Vec<Complex<f64>> = series
        .iter()
        .map(|x| Complex::new(x - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(fft_len)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(fft_len).process(&mut buffer);
    for c in buffer.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(fft_len).process(&mut buffer);

    let gamma0 = buffer[0].re;
    if gamma0 <= 0.0 {
        return Array1::zeros(n);
    }
    buffer[..n].iter().map(|c| c.re / gamma0).collect()
}

/// Effective sample size of a single series.
pub fn ess(series: ArrayView1<f64>) -> f64 {
    let rho = autocorrelation(series);
    ess_from_autocorrelation(series.len(), rho.as_slice().unwrap_or(&[]))
}

/// Effective sample size of every column of a `[n_samples, dim]` array.
pub fn ess_columns(samples: ArrayView2<f64>) -> Array1<f64> {
    samples.axis_iter(Axis(1)).map(ess).collect()
}

/// Acceptance rate over a sliding window, used for progress messages.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceTracker {
    window: VecDeque<bool>,
    capacity: usize,
    accepted_in_window: usize,
    total: usize,
    total_accepted: usize,
}

impl AcceptanceTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
            accepted_in_window: 0,
            total: 0,
            total_accepted: 0,
        }
    }

    pub fn record(&mut self, accepted: bool) {
        self.total += 1;
        self.total_accepted += accepted as usize;
        self.window.push_back(accepted);
        self.accepted_in_window += accepted as usize;
        if self.window.len() > self.capacity {
            if let Some(true) = self.window.pop_front() {
                self.accepted_in_window -= 1;
            }
        }
    }

    /// Acceptance rate over the last `capacity` steps.
    pub fn recent(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.accepted_in_window as f64 / self.window.len() as f64
    }

    /// Acceptance rate over every recorded step.
    pub fn overall(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total_accepted as f64 / self.total as f64
    }
}
