//! Seeded deterministic RNG and the distributions the latency model needs.
//!
//! # Design Choices
//!
//! **Generator**: 256-bit xoshiro-family state, seeded through SplitMix64
//! so that nearby seeds still produce decorrelated streams. Fast, stable
//! output across platforms, and good enough tail behavior for a latency
//! simulator. Not cryptographically secure.
//!
//! **No `Copy`**: copying an RNG duplicates the stream and silently makes
//! two samplers draw identical values. Use `Clone` explicitly, or better,
//! fork a sub-stream with [`SeededRng::fork`].
//!
//! **Reproducibility**: the stream is advanced sequentially. For a fixed
//! seed the sequence is reproducible only when sampling sites are visited
//! in a fixed order, i.e. from a single thread. Worker threads therefore
//! each own a forked sub-stream instead of sharing one generator.

/// SplitMix64 finalizer. Used for RNG seeding and for deterministic
/// per-node hashes (evidence estimates, stop-decision tie-breakers) that
/// must not consume the main stream.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Deterministic RNG with 256 bits of state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeededRng {
    s: [u64; 4],
}

impl SeededRng {
    /// Create a generator from a seed. The four state words are produced by
    /// a SplitMix64 walk, which also maps seed 0 to a usable state.
    pub fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for w in &mut s {
            x = x.wrapping_add(0x9e3779b97f4a7c15);
            *w = mix64(x);
        }
        Self { s }
    }

    /// Fork a decorrelated sub-stream, e.g. one per worker thread.
    pub fn fork(seed: u64, lane: u64) -> Self {
        Self::new(mix64(seed ^ lane.wrapping_mul(0x9e3779b97f4a7c15)))
    }

    #[inline]
    fn rotl(x: u64, k: u32) -> u64 {
        x.rotate_left(k)
    }

    /// Next raw 64-bit value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let result = Self::rotl(self.s[0].wrapping_add(self.s[3]), 23).wrapping_add(self.s[0]);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = Self::rotl(self.s[3], 45);
        result
    }

    /// Uniform in `[0, 1)` with 53 bits of precision.
    #[inline]
    pub fn uniform01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / 9007199254740992.0 // 2^53
    }

    /// Uniform in `[a, b)`.
    #[inline]
    pub fn uniform(&mut self, a: f64, b: f64) -> f64 {
        a + self.uniform01() * (b - a)
    }

    /// Bernoulli draw. `p <= 0` is always false, `p >= 1` always true.
    #[inline]
    pub fn bernoulli(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.uniform01() < p
    }

    /// Normal via Box-Muller from two uniforms in the open unit interval.
    pub fn normal(&mut self, mean: f64, stddev: f64) -> f64 {
        let mut u1 = self.uniform01();
        let mut u2 = self.uniform01();
        while u1 <= 0.0 || u1 >= 1.0 {
            u1 = self.uniform01();
        }
        while u2 <= 0.0 || u2 >= 1.0 {
            u2 = self.uniform01();
        }
        mean + stddev * normal_from_uniform(u1, u2)
    }

    /// Lognormal with log-mean `mu` and log-stddev `sigma`. Always
    /// strictly positive.
    pub fn lognormal(&mut self, mu: f64, sigma: f64) -> f64 {
        let u1 = self.uniform01();
        let mut u2 = self.uniform01();
        while u2 <= 0.0 || u2 >= 1.0 {
            u2 = self.uniform01();
        }
        let z = normal_from_uniform(u1, u2);
        let x = (mu + sigma * z).exp();
        if x > 0.0 {
            x
        } else {
            f64::MIN_POSITIVE
        }
    }

    /// Gamma(shape, scale) via Marsaglia-Tsang, with the standard
    /// `shape < 1` boost.
    pub fn gamma(&mut self, shape: f64, scale: f64) -> f64 {
        if shape < 1.0 {
            let boost = self.uniform01().powf(1.0 / shape);
            return self.gamma(shape + 1.0, scale) * boost;
        }
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        loop {
            let mut x;
            let mut v;
            loop {
                x = self.normal(0.0, 1.0);
                v = 1.0 + c * x;
                if v > 0.0 {
                    break;
                }
            }
            v = v * v * v;
            let u = self.uniform01();
            if u < 1.0 - 0.0331 * (x * x) * (x * x) {
                return d * v * scale;
            }
            if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
                return d * v * scale;
            }
        }
    }
}

/// Box-Muller kernel. Returns 0 for degenerate `u1` so callers can decide
/// how to resample.
#[inline]
fn normal_from_uniform(u1: f64, u2: f64) -> f64 {
    if u1 <= 0.0 || u1 >= 1.0 {
        return 0.0;
    }
    let r = (-2.0 * u1.ln()).sqrt();
    r * (2.0 * std::f64::consts::PI * u2).cos()
}
