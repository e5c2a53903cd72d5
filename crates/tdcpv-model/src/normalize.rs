//! Numerical integration on bounded 1-D intervals.
//!
//! Gauss-Legendre rules on `[-1, 1]`, mapped onto sub-intervals. Oscillating integrands
//! (`cos(Δm t)` with `Δm ≈ 18 ps⁻¹`) are handled by splitting the range into segments no wider
//! than a caller-supplied width and applying a fixed rule per segment.

/// Gauss-Legendre quadrature order (number of nodes per segment).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuadratureOrder {
    /// 8 nodes per segment.
    N8,
    /// 16 nodes per segment (default).
    #[default]
    N16,
    /// 32 nodes per segment.
    N32,
    /// 64 nodes per segment.
    N64,
}

impl QuadratureOrder {
    fn n(self) -> usize {
        match self {
            Self::N8 => 8,
            Self::N16 => 16,
            Self::N32 => 32,
            Self::N64 => 64,
        }
    }
}

/// Compute Gauss-Legendre nodes and weights on `[-1, 1]` for the given order.
///
/// Uses Newton iteration to find roots of the Legendre polynomial P_n(x),
/// then computes weights from the derivative P'_n at each root.
/// Exploits symmetry: only computes half the roots.
fn gauss_legendre_nodes_weights(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0f64; n];
    let mut weights = vec![0.0f64; n];

    if n == 0 {
        return (nodes, weights);
    }
    if n == 1 {
        weights[0] = 2.0;
        return (nodes, weights);
    }

    let nf = n as f64;
    let m = n.div_ceil(2);

    for i in 0..m {
        // Initial guess via Chebyshev approximation.
        let mut x = ((std::f64::consts::PI * (i as f64 + 0.75)) / (nf + 0.5)).cos();

        for _ in 0..100 {
            let (p1, p0) = legendre_pair(n, x);
            // P'_n(x) = n * (x * P_n(x) - P_{n-1}(x)) / (x^2 - 1)
            let dp = nf * (x * p1 - p0) / (x * x - 1.0);
            let dx = p1 / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }

        let (p1, p0) = legendre_pair(n, x);
        let dp = nf * (x * p1 - p0) / (x * x - 1.0);
        let w = 2.0 / ((1.0 - x * x) * dp * dp);

        nodes[i] = -x;
        nodes[n - 1 - i] = x;
        weights[i] = w;
        weights[n - 1 - i] = w;
    }

    (nodes, weights)
}

/// `(P_n(x), P_{n-1}(x))` via the three-term recurrence.
fn legendre_pair(n: usize, x: f64) -> (f64, f64) {
    let mut p0 = 1.0f64;
    let mut p1 = x;
    for j in 2..=n {
        let jf = j as f64;
        let p2 = ((2.0 * jf - 1.0) * x * p1 - (jf - 1.0) * p0) / jf;
        p0 = p1;
        p1 = p2;
    }
    (p1, p0)
}

/// Composite Gauss-Legendre rule with a fixed number of nodes per segment.
#[derive(Debug, Clone)]
pub struct CompositeRule {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl CompositeRule {
    /// Build a rule of the given order.
    pub fn new(order: QuadratureOrder) -> Self {
        let (nodes, weights) = gauss_legendre_nodes_weights(order.n());
        Self { nodes, weights }
    }

    /// Absolute abscissae and weights covering `[a, b]` with segments no wider than `max_width`.
    pub fn grid(&self, a: f64, b: f64, max_width: f64) -> (Vec<f64>, Vec<f64>) {
        if !(b > a) {
            return (Vec::new(), Vec::new());
        }
        let n_seg = segment_count(a, b, max_width);
        let h = (b - a) / n_seg as f64;
        let mut xs = Vec::with_capacity(n_seg * self.nodes.len());
        let mut ws = Vec::with_capacity(n_seg * self.nodes.len());
        for s in 0..n_seg {
            let lo = a + s as f64 * h;
            let mid = lo + 0.5 * h;
            for (&x, &w) in self.nodes.iter().zip(&self.weights) {
                xs.push(mid + 0.5 * h * x);
                ws.push(0.5 * h * w);
            }
        }
        (xs, ws)
    }

    /// Integrate `f` over `[a, b]`.
    pub fn integrate(&self, a: f64, b: f64, max_width: f64, mut f: impl FnMut(f64) -> f64) -> f64 {
        let (xs, ws) = self.grid(a, b, max_width);
        xs.iter().zip(&ws).map(|(&x, &w)| w * f(x)).sum()
    }
}

impl Default for CompositeRule {
    fn default() -> Self {
        Self::new(QuadratureOrder::default())
    }
}

fn segment_count(a: f64, b: f64, max_width: f64) -> usize {
    if !(max_width.is_finite() && max_width > 0.0) {
        return 1;
    }
    (((b - a) / max_width).ceil() as usize).clamp(1, 1 << 20)
}
