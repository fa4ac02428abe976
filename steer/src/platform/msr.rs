//! Raw MSR signals and controls.
//!
//! A raw signal transports the full 64-bit register through the batch
//! buffer, bit-cast into the `f64` signal domain so no precision is lost in
//! transit. A field signal extracts a bit range from a raw signal and
//! decodes it with one of the encode functions; a field control performs
//! the inverse, staging an encoded field behind a write mask.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::platform::msrio::SharedBatch;
use crate::platform::{Control, Signal, SharedSignal};

/// Reinterprets a register value for transport through the `f64` signal
/// domain without loss.
pub fn field_to_signal(field: u64) -> f64 {
    f64::from_bits(field)
}

/// Inverse of [`field_to_signal`].
pub fn signal_to_field(signal: f64) -> u64 {
    signal.to_bits()
}

/// Decode functions for an MSR bit field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MsrFunction {
    /// Multiply the field by a constant.
    Scale,
    /// `1 / 2^field`.
    LogHalf,
    /// A seven-bit float: `2^Y * (1 + Z/4)` with Y in bits 0..=4 and Z in
    /// bits 5..=6 of the field.
    SevenBitFloat,
    /// A wrapping hardware counter of the field's declared width; each
    /// observed decrease adds one field range to an accumulator.
    Overflow,
}

/// A whole-register signal fed from the batch buffer.
pub struct RawMsrSignal {
    batch: SharedBatch,
    index: usize,
    cpu: usize,
    offset: u64,
    is_batch_ready: bool,
}

impl RawMsrSignal {
    /// Registers the register in the batch and wraps it as a signal.
    pub fn new(batch: SharedBatch, cpu: usize, offset: u64) -> SharedSignal {
        let index = batch.borrow_mut().push(cpu, offset);
        Rc::new(RefCell::new(RawMsrSignal { batch, index, cpu, offset, is_batch_ready: false }))
    }
}

impl Signal for RawMsrSignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.is_batch_ready = true;
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(Error::Runtime("sample() called before setup_batch()".into()));
        }
        Ok(field_to_signal(self.batch.borrow().value(self.index)))
    }

    fn read(&mut self) -> Result<f64> {
        Ok(field_to_signal(self.batch.borrow().read_one(self.cpu, self.offset)?))
    }
}

/// A decoded bit field of a raw MSR signal.
pub struct MsrFieldSignal {
    raw: SharedSignal,
    begin_bit: u32,
    end_bit: u32,
    function: MsrFunction,
    scalar: f64,
    num_overflow: u64,
    last_field: Option<u64>,
    is_batch_ready: bool,
}

impl MsrFieldSignal {
    /// Wraps `raw`, decoding bits `begin_bit..=end_bit` with `function`
    /// and multiplying by `scalar`.
    pub fn new(raw: SharedSignal,
               begin_bit: u32,
               end_bit: u32,
               function: MsrFunction,
               scalar: f64) -> Result<SharedSignal> {
        if begin_bit > end_bit {
            return Err(Error::Logic("begin bit must be <= end bit".into()));
        }
        if end_bit - begin_bit >= 63 {
            return Err(Error::Logic("64-bit fields are not supported".into()));
        }
        Ok(Rc::new(RefCell::new(MsrFieldSignal {
            raw,
            begin_bit,
            end_bit,
            function,
            scalar,
            num_overflow: 0,
            last_field: None,
            is_batch_ready: false,
        })))
    }

    fn mask(&self) -> u64 {
        ((1u64 << (self.end_bit - self.begin_bit + 1)) - 1) << self.begin_bit
    }

    fn field(&self, raw: f64) -> u64 {
        (signal_to_field(raw) & self.mask()) >> self.begin_bit
    }

    fn field_width(&self) -> u32 {
        self.end_bit - self.begin_bit + 1
    }

    /// Decodes a field, tracking counter wraparound only when requested.
    fn decode(&mut self, field: u64, track_overflow: bool) -> f64 {
        match self.function {
            MsrFunction::Scale => field as f64 * self.scalar,
            MsrFunction::LogHalf => self.scalar / (1u64 << field.min(63)) as f64,
            MsrFunction::SevenBitFloat => {
                let y = field & 0x1F;
                let z = (field >> 5) & 0x3;
                (1u64 << y.min(63)) as f64 * (1.0 + z as f64 / 4.0) * self.scalar
            }
            MsrFunction::Overflow => {
                if track_overflow {
                    if let Some(last) = self.last_field {
                        if field < last {
                            self.num_overflow += 1;
                        }
                    }
                    self.last_field = Some(field);
                    let range = 2f64.powi(self.field_width() as i32);
                    (field as f64 + self.num_overflow as f64 * range) * self.scalar
                }
                else {
                    field as f64 * self.scalar
                }
            }
        }
    }
}

impl Signal for MsrFieldSignal {
    fn setup_batch(&mut self) -> Result<()> {
        // Repeated setup has no further effect.
        if !self.is_batch_ready {
            self.raw.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(Error::Runtime("sample() called before setup_batch()".into()));
        }
        let raw = self.raw.borrow_mut().sample()?;
        let field = self.field(raw);
        Ok(self.decode(field, true))
    }

    fn read(&mut self) -> Result<f64> {
        // The one-shot path observes the counter out of band and must not
        // disturb the batch path's wraparound tracking.
        let raw = self.raw.borrow_mut().read()?;
        let field = self.field(raw);
        Ok(self.decode(field, false))
    }
}

/// A staged bit-field control over one register.
pub struct MsrFieldControl {
    batch: SharedBatch,
    cpu: usize,
    offset: u64,
    begin_bit: u32,
    end_bit: u32,
    scalar: f64,
}

impl MsrFieldControl {
    /// A control writing bits `begin_bit..=end_bit` of the register at
    /// `offset` on `cpu`; settings divide by `scalar` to encode.
    pub fn new(batch: SharedBatch,
               cpu: usize,
               offset: u64,
               begin_bit: u32,
               end_bit: u32,
               scalar: f64) -> Result<Box<dyn Control>> {
        if begin_bit > end_bit {
            return Err(Error::Logic("begin bit must be <= end bit".into()));
        }
        if end_bit - begin_bit >= 63 {
            return Err(Error::Logic("64-bit fields are not supported".into()));
        }
        Ok(Box::new(MsrFieldControl { batch, cpu, offset, begin_bit, end_bit, scalar }))
    }

    fn mask(&self) -> u64 {
        ((1u64 << (self.end_bit - self.begin_bit + 1)) - 1) << self.begin_bit
    }
}

impl Control for MsrFieldControl {
    fn write(&mut self, setting: f64) -> Result<()> {
        if !setting.is_finite() || setting < 0.0 {
            return Err(Error::InvalidArgument(
                format!("control setting must be finite and non-negative, got {}", setting)));
        }
        let max_field = self.mask() >> self.begin_bit;
        let field = ((setting / self.scalar).round() as u64).min(max_field);
        self.batch.borrow().write_one(self.cpu, self.offset, field << self.begin_bit, self.mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::msrio::{MemoryMsr, MsrBatch, MsrIo, SharedMsrIo};

    fn setup() -> (Rc<RefCell<MemoryMsr>>, SharedBatch) {
        let device = Rc::new(RefCell::new(MemoryMsr::new()));
        let erased: SharedMsrIo = Rc::clone(&device) as SharedMsrIo;
        let batch = MsrBatch::new(erased);
        (device, batch)
    }

    fn field_signal(batch: &SharedBatch,
                    begin: u32, end: u32,
                    function: MsrFunction,
                    scalar: f64) -> SharedSignal {
        let raw = RawMsrSignal::new(Rc::clone(batch), 0, 0x198);
        MsrFieldSignal::new(raw, begin, end, function, scalar).unwrap()
    }

    #[test]
    fn read_scale() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 16, 23, MsrFunction::Scale, 1.5);
        device.borrow_mut().poke(0, 0x198, 0xF145_8321);
        assert_eq!(sig.borrow_mut().read().unwrap(), 0x45 as f64 * 1.5);
    }

    #[test]
    fn sample_scale_through_batch() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 16, 23, MsrFunction::Scale, 2.7);
        sig.borrow_mut().setup_batch().unwrap();
        device.borrow_mut().poke(0, 0x198, 0xF167_8321);
        batch.borrow_mut().read_batch().unwrap();
        assert_eq!(sig.borrow_mut().sample().unwrap(), 0x67 as f64 * 2.7);
    }

    #[test]
    fn read_log_half() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 16, 23, MsrFunction::LogHalf, 1.0);
        device.borrow_mut().poke(0, 0x198, 0xF102_8321); // field is 0x02
        assert_eq!(sig.borrow_mut().read().unwrap(), 0.25);
    }

    #[test]
    fn read_seven_bit_float() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 16, 23, MsrFunction::SevenBitFloat, 3.0);
        device.borrow_mut().poke(0, 0x198, 0xF141_8321); // field is 0x41
        assert_eq!(sig.borrow_mut().read().unwrap(), 9.0);
    }

    #[test]
    fn sample_overflow_accumulates() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 0, 3, MsrFunction::Overflow, 1.0);
        sig.borrow_mut().setup_batch().unwrap();

        let mut expect = |raw: u64, expected: f64| {
            device.borrow_mut().poke(0, 0x198, raw);
            batch.borrow_mut().read_batch().unwrap();
            assert_eq!(sig.borrow_mut().sample().unwrap(), expected);
        };
        expect(0x0005, 5.0);
        expect(0x0004, 20.0); // 4 + 16: one wrap
        expect(0x000A, 26.0); // 10 + 16
        expect(0x0001, 33.0); // 1 + 16 + 16
    }

    #[test]
    fn read_overflow_does_not_accumulate() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 0, 3, MsrFunction::Overflow, 1.0);
        for (raw, expected) in [(0x0005u64, 5.0), (0x0004, 4.0), (0x000A, 10.0)] {
            device.borrow_mut().poke(0, 0x198, raw);
            assert_eq!(sig.borrow_mut().read().unwrap(), expected);
        }
    }

    #[test]
    fn wide_counter_overflow() {
        let (device, batch) = setup();
        let sig = field_signal(&batch, 0, 47, MsrFunction::Overflow, 1.0);
        sig.borrow_mut().setup_batch().unwrap();

        device.borrow_mut().poke(0, 0x198, 0xFFFF_FF27_AAE8);
        batch.borrow_mut().read_batch().unwrap();
        assert_eq!(sig.borrow_mut().sample().unwrap(), 0xFFFF_FF27_AAE8u64 as f64);

        device.borrow_mut().poke(0, 0x198, 0xFFFF_000D_D5D0);
        batch.borrow_mut().read_batch().unwrap();
        let expected = (0xFFFF_000D_D5D0u64 + (1u64 << 48)) as f64;
        assert_eq!(sig.borrow_mut().sample().unwrap(), expected);
    }

    #[test]
    fn monotone_field_yields_monotone_accumulator() {
        // Truncate a monotone counter to 4 bits; the decoded accumulator
        // must itself be monotone and equal the counter plus k * 16.
        let (device, batch) = setup();
        let sig = field_signal(&batch, 0, 3, MsrFunction::Overflow, 1.0);
        sig.borrow_mut().setup_batch().unwrap();

        let mut previous = f64::MIN;
        for counter in (0u64..200).step_by(7) {
            device.borrow_mut().poke(0, 0x198, counter & 0xF);
            batch.borrow_mut().read_batch().unwrap();
            let decoded = sig.borrow_mut().sample().unwrap();
            assert!(decoded >= previous);
            let k = (decoded - (counter & 0xF) as f64) / 16.0;
            assert_eq!(k.fract(), 0.0);
            assert!(k >= 0.0);
            previous = decoded;
        }
    }

    #[test]
    fn constructor_rejects_bad_fields() {
        let (_device, batch) = setup();
        let raw = RawMsrSignal::new(Rc::clone(&batch), 0, 0x198);
        assert!(MsrFieldSignal::new(Rc::clone(&raw), 4, 0, MsrFunction::Scale, 1.0).is_err());
        assert!(MsrFieldSignal::new(Rc::clone(&raw), 0, 63, MsrFunction::Scale, 1.0).is_err());
        assert!(MsrFieldSignal::new(raw, 0, 0, MsrFunction::Scale, 1.0).is_ok());
    }

    #[test]
    fn sample_before_setup_fails() {
        let (_device, batch) = setup();
        let sig = field_signal(&batch, 0, 7, MsrFunction::Scale, 1.0);
        assert!(sig.borrow_mut().sample().is_err());
    }

    #[test]
    fn control_write_encodes_and_masks() {
        let (device, batch) = setup();
        device.borrow_mut().poke(0, 0x610, 0xFFFF_8000);
        let mut ctl = MsrFieldControl::new(Rc::clone(&batch), 0, 0x610, 0, 14, 0.125).unwrap();
        ctl.write(160.0).unwrap();
        // 160 W / 0.125 = 1280 = 0x500; bits above 14 untouched.
        assert_eq!(device.borrow().peek(0, 0x610), 0xFFFF_8500);
    }

    #[test]
    fn control_clamps_to_field() {
        let (device, batch) = setup();
        let mut ctl = MsrFieldControl::new(Rc::clone(&batch), 0, 0x610, 0, 14, 0.125).unwrap();
        ctl.write(1.0e9).unwrap();
        assert_eq!(device.borrow().peek(0, 0x610), 0x7FFF);
        assert!(ctl.write(f64::NAN).is_err());
    }
}
