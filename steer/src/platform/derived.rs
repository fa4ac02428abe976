//! Signals derived from other signals.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::error::Result;
use crate::helper::CircularBuffer;
use crate::platform::{Signal, SharedSignal};

/// Monotonic seconds since construction.
pub struct TimeSignal {
    start: Instant,
}

impl TimeSignal {
    /// A signal reading zero at construction time.
    pub fn new() -> SharedSignal {
        Rc::new(RefCell::new(TimeSignal { start: Instant::now() }))
    }
}

impl Signal for TimeSignal {
    fn setup_batch(&mut self) -> Result<()> {
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        Ok(self.start.elapsed().as_secs_f64())
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.start.elapsed().as_secs_f64())
    }
}

/// Least-squares slope of a signal against a time signal over a sliding
/// window of samples.
pub struct DerivativeSignal {
    time_sig: SharedSignal,
    y_sig: SharedSignal,
    num_history_sample: usize,
    sleep_time: f64,
    history: CircularBuffer<(f64, f64)>,
    last_time: f64,
}

impl DerivativeSignal {
    /// Differentiates `y_sig` with respect to `time_sig`.
    ///
    /// At most `num_history_sample` points enter the fit; a new point is
    /// dropped when less than `sleep_time` has elapsed since the previous
    /// one, so a caller sampling faster than the platform updates does not
    /// flood the window with duplicates.
    pub fn new(time_sig: SharedSignal,
               y_sig: SharedSignal,
               num_history_sample: usize,
               sleep_time: f64) -> SharedSignal {
        Rc::new(RefCell::new(DerivativeSignal {
            time_sig,
            y_sig,
            num_history_sample,
            sleep_time,
            history: CircularBuffer::new(num_history_sample.max(1)),
            last_time: f64::NEG_INFINITY,
        }))
    }

    fn slope(points: &CircularBuffer<(f64, f64)>) -> f64 {
        if points.len() < 2 {
            return f64::NAN;
        }
        let n = points.len() as f64;
        let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let numer: f64 = points.iter().map(|(t, y)| (t - mean_t) * (y - mean_y)).sum();
        let denom: f64 = points.iter().map(|(t, _)| (t - mean_t).powi(2)).sum();
        if denom == 0.0 {
            f64::NAN
        }
        else {
            numer / denom
        }
    }
}

impl Signal for DerivativeSignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.time_sig.borrow_mut().setup_batch()?;
        self.y_sig.borrow_mut().setup_batch()
    }

    fn sample(&mut self) -> Result<f64> {
        let time = self.time_sig.borrow_mut().sample()?;
        let value = self.y_sig.borrow_mut().sample()?;
        if self.history.is_empty() || time - self.last_time >= self.sleep_time {
            self.history.insert((time, value));
            self.last_time = time;
        }
        Ok(Self::slope(&self.history))
    }

    fn read(&mut self) -> Result<f64> {
        // One-shot: take a full window of back-to-back readings.
        let mut window = CircularBuffer::new(self.num_history_sample.max(2));
        for _ in 0..self.num_history_sample {
            let time = self.time_sig.borrow_mut().read()?;
            let value = self.y_sig.borrow_mut().read()?;
            window.insert((time, value));
        }
        Ok(Self::slope(&window))
    }
}

/// Element-wise difference of two signals.
pub struct DifferenceSignal {
    minuend: SharedSignal,
    subtrahend: SharedSignal,
}

impl DifferenceSignal {
    /// `minuend - subtrahend`.
    pub fn new(minuend: SharedSignal, subtrahend: SharedSignal) -> SharedSignal {
        Rc::new(RefCell::new(DifferenceSignal { minuend, subtrahend }))
    }
}

impl Signal for DifferenceSignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.minuend.borrow_mut().setup_batch()?;
        self.subtrahend.borrow_mut().setup_batch()
    }

    fn sample(&mut self) -> Result<f64> {
        Ok(self.minuend.borrow_mut().sample()? - self.subtrahend.borrow_mut().sample()?)
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.minuend.borrow_mut().read()? - self.subtrahend.borrow_mut().read()?)
    }
}

/// Ratio of two signals; a zero denominator yields NaN.
pub struct DivisionSignal {
    numerator: SharedSignal,
    denominator: SharedSignal,
}

impl DivisionSignal {
    /// `numerator / denominator`.
    pub fn new(numerator: SharedSignal, denominator: SharedSignal) -> SharedSignal {
        Rc::new(RefCell::new(DivisionSignal { numerator, denominator }))
    }

    fn divide(numerator: f64, denominator: f64) -> f64 {
        if denominator == 0.0 {
            f64::NAN
        }
        else {
            numerator / denominator
        }
    }
}

impl Signal for DivisionSignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.numerator.borrow_mut().setup_batch()?;
        self.denominator.borrow_mut().setup_batch()
    }

    fn sample(&mut self) -> Result<f64> {
        let numerator = self.numerator.borrow_mut().sample()?;
        let denominator = self.denominator.borrow_mut().sample()?;
        Ok(Self::divide(numerator, denominator))
    }

    fn read(&mut self) -> Result<f64> {
        let numerator = self.numerator.borrow_mut().read()?;
        let denominator = self.denominator.borrow_mut().read()?;
        Ok(Self::divide(numerator, denominator))
    }
}

/// Integrates a scalability ratio against elapsed time.
pub struct ScalabilitySignal {
    ratio: SharedSignal,
    time_sig: SharedSignal,
    total: f64,
    last_time: Option<f64>,
}

impl ScalabilitySignal {
    /// Accumulates `ratio * dt` across batch samples.
    pub fn new(ratio: SharedSignal, time_sig: SharedSignal) -> SharedSignal {
        Rc::new(RefCell::new(ScalabilitySignal {
            ratio,
            time_sig,
            total: 0.0,
            last_time: None,
        }))
    }
}

impl Signal for ScalabilitySignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.ratio.borrow_mut().setup_batch()?;
        self.time_sig.borrow_mut().setup_batch()
    }

    fn sample(&mut self) -> Result<f64> {
        let time = self.time_sig.borrow_mut().sample()?;
        let ratio = self.ratio.borrow_mut().sample()?;
        if let Some(last) = self.last_time {
            if !ratio.is_nan() && time > last {
                self.total += ratio * (time - last);
            }
        }
        self.last_time = Some(time);
        Ok(self.total)
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.total)
    }
}

/// Folds several signals into one with a combiner.
pub struct CombinedSignal {
    children: Vec<SharedSignal>,
    combine: fn(&[f64]) -> f64,
}

impl CombinedSignal {
    /// Combines `children` with `combine`, e.g. summing per-package energy
    /// into a board total.
    pub fn new(children: Vec<SharedSignal>, combine: fn(&[f64]) -> f64) -> SharedSignal {
        Rc::new(RefCell::new(CombinedSignal { children, combine }))
    }

    /// Sum of the inputs.
    pub fn sum(values: &[f64]) -> f64 {
        values.iter().sum()
    }

    /// Arithmetic mean of the inputs.
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            f64::NAN
        }
        else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

impl Signal for CombinedSignal {
    fn setup_batch(&mut self) -> Result<()> {
        for child in &self.children {
            child.borrow_mut().setup_batch()?;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        let values: Vec<f64> = self
            .children
            .iter()
            .map(|child| child.borrow_mut().sample())
            .collect::<Result<_>>()?;
        Ok((self.combine)(&values))
    }

    fn read(&mut self) -> Result<f64> {
        let values: Vec<f64> = self
            .children
            .iter()
            .map(|child| child.borrow_mut().read())
            .collect::<Result<_>>()?;
        Ok((self.combine)(&values))
    }
}
