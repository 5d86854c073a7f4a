use std::fmt;

/// Running min/max/mean of one path length measure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Running {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    sum: u64,
}

impl Running {
    pub fn push(&mut self, n: usize) {
        if self.count == 0 || n < self.min {
            self.min = n;
        }
        self.max = self.max.max(n);
        self.sum += n as u64;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

impl fmt::Display for Running {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "min {} max {} avg {:.2}", self.min, self.max, self.mean())
    }
}

/// Symbolic (constraint count) and concrete (branch count) path lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathStats {
    pub symbolic: Running,
    pub concrete: Running,
}

impl PathStats {
    pub fn record(&mut self, constraints: usize, branches: usize) {
        self.symbolic.push(constraints);
        self.concrete.push(branches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_lengths() {
        let mut stats = PathStats::default();
        assert_eq!(stats.symbolic.mean(), 0.0);

        stats.record(3, 10);
        stats.record(1, 30);
        stats.record(5, 20);

        assert_eq!(stats.symbolic.min, 1);
        assert_eq!(stats.symbolic.max, 5);
        assert_eq!(stats.symbolic.mean(), 3.0);
        assert_eq!(stats.concrete.count, 3);
        assert_eq!(stats.concrete.to_string(), "min 10 max 30 avg 20.00");
    }
}
