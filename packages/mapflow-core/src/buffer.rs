//! Per-instance ring of timetagged vector samples.
//!
//! Each signal instance owns one [`ValueBuffer`] holding the `mlen` most
//! recent samples, where `mlen` is the deepest history any consumer's
//! expression references. Reads address history by non-positive offset:
//! `0` is the newest sample, `-1` the one before it. A read past the number
//! of samples actually written returns `None`; callers treat that as
//! "no value" and abort the current evaluation.

use crate::time::Timetag;
use crate::value::{ScalarType, Vector};

#[derive(Clone, Debug)]
pub struct ValueBuffer {
    ty: ScalarType,
    vec_len: usize,
    samples: Vec<Vector>,
    times: Vec<Timetag>,
    /// Slot of the most recent sample.
    pos: usize,
    /// Saturating count of samples written.
    count: usize,
}

impl ValueBuffer {
    pub fn new(ty: ScalarType, vec_len: usize, mlen: usize) -> Self {
        let mlen = mlen.max(1);
        ValueBuffer {
            ty,
            vec_len,
            samples: vec![Vector::zeros(ty, vec_len); mlen],
            times: vec![Timetag::default(); mlen],
            pos: 0,
            count: 0,
        }
    }

    pub fn ty(&self) -> ScalarType {
        self.ty
    }

    pub fn vec_len(&self) -> usize {
        self.vec_len
    }

    /// History depth of the ring.
    pub fn mlen(&self) -> usize {
        self.samples.len()
    }

    pub fn num_samples(&self) -> usize {
        self.count
    }

    /// Grows the ring to hold at least `mlen` samples. Shrinking is never
    /// done implicitly; existing history is discarded on resize since the
    /// ring layout changes.
    pub fn set_history(&mut self, mlen: usize) {
        if mlen <= self.mlen() {
            return;
        }
        self.samples = vec![Vector::zeros(self.ty, self.vec_len); mlen];
        self.times = vec![Timetag::default(); mlen];
        self.pos = 0;
        self.count = 0;
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Writes a sample, advancing the ring. The value is cast to the
    /// buffer's element type; a short vector is broadcast, a long one
    /// truncated.
    pub fn write(&mut self, value: &Vector, time: Timetag) {
        if value.is_empty() {
            return;
        }
        if self.count > 0 {
            self.pos = (self.pos + 1) % self.mlen();
        }
        let slot = &mut self.samples[self.pos];
        for i in 0..self.vec_len {
            slot.set(i, value.get_broadcast(i.min(value.len() - 1)));
        }
        self.times[self.pos] = time;
        self.count = (self.count + 1).min(self.mlen());
    }

    fn slot(&self, offset: i32) -> Option<usize> {
        let back = (-offset) as usize;
        if offset > 0 || back >= self.count {
            return None;
        }
        Some((self.pos + self.mlen() - back) % self.mlen())
    }

    /// Sample at history `offset` in `[-(mlen-1), 0]`.
    pub fn read(&self, offset: i32) -> Option<&Vector> {
        self.slot(offset).map(|s| &self.samples[s])
    }

    /// Timetag of the sample at history `offset`.
    pub fn time(&self, offset: i32) -> Option<Timetag> {
        self.slot(offset).map(|s| self.times[s])
    }

    /// Overwrites the sample at history `offset` in place, without
    /// advancing the ring. Used to seed past samples (`y{-k} = ...`).
    /// Slots that have never been written become readable.
    pub fn write_history(&mut self, offset: i32, value: &Vector, time: Timetag) {
        let back = (-offset) as usize;
        if offset > 0 || back >= self.mlen() || value.is_empty() {
            return;
        }
        let slot = (self.pos + self.mlen() - back) % self.mlen();
        let dst = &mut self.samples[slot];
        for i in 0..self.vec_len {
            dst.set(i, value.get_broadcast(i.min(value.len() - 1)));
        }
        self.times[slot] = time;
        self.count = self.count.max(back + 1);
    }

    /// Sample at a possibly fractional history offset, linearly
    /// interpolating between the two adjacent samples.
    pub fn read_interp(&self, offset: f64) -> Option<Vector> {
        let hi = offset.ceil() as i32;
        let frac = hi as f64 - offset;
        let a = self.read(hi)?;
        if frac == 0.0 {
            return Some(a.clone());
        }
        let b = self.read(hi - 1)?;
        let mut out = Vector::zeros(self.ty, self.vec_len);
        for i in 0..self.vec_len {
            let x = a.get(i);
            out.set(i, x + (b.get(i) - x) * frac);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tt(s: u32) -> Timetag {
        Timetag::new(s, 0)
    }

    #[test]
    fn empty_buffer_reads_absence() {
        let buf = ValueBuffer::new(ScalarType::Float, 1, 4);
        assert_eq!(buf.num_samples(), 0);
        assert!(buf.read(0).is_none());
    }

    #[test]
    fn ring_advances_and_wraps() {
        let mut buf = ValueBuffer::new(ScalarType::Int32, 1, 3);
        for (i, v) in [10, 20, 30, 40].iter().enumerate() {
            buf.write(&Vector::I32(vec![*v]), tt(i as u32));
        }
        assert_eq!(buf.num_samples(), 3);
        assert_eq!(buf.read(0), Some(&Vector::I32(vec![40])));
        assert_eq!(buf.read(-1), Some(&Vector::I32(vec![30])));
        assert_eq!(buf.read(-2), Some(&Vector::I32(vec![20])));
        assert!(buf.read(-3).is_none());
        assert_eq!(buf.time(-1), Some(tt(2)));
    }

    #[test]
    fn history_reads_need_enough_samples() {
        let mut buf = ValueBuffer::new(ScalarType::Float, 1, 4);
        buf.write(&Vector::F32(vec![1.0]), tt(0));
        assert!(buf.read(-1).is_none());
        buf.write(&Vector::F32(vec![2.0]), tt(1));
        assert_eq!(buf.read(-1), Some(&Vector::F32(vec![1.0])));
    }

    #[test]
    fn write_casts_to_element_type() {
        let mut buf = ValueBuffer::new(ScalarType::Float, 1, 2);
        buf.write(&Vector::I32(vec![7]), tt(0));
        assert_eq!(buf.read(0), Some(&Vector::F32(vec![7.0])));
    }

    #[test]
    fn fractional_offset_interpolates() {
        let mut buf = ValueBuffer::new(ScalarType::Double, 1, 4);
        buf.write(&Vector::F64(vec![0.0]), tt(0));
        buf.write(&Vector::F64(vec![10.0]), tt(1));
        let mid = buf.read_interp(-0.5).unwrap();
        assert!((mid.get(0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn history_seeding_backfills_unwritten_slots() {
        let mut buf = ValueBuffer::new(ScalarType::Float, 1, 4);
        buf.write(&Vector::F32(vec![5.0]), tt(10));
        buf.write_history(-1, &Vector::F32(vec![4.0]), tt(9));
        assert_eq!(buf.read(-1), Some(&Vector::F32(vec![4.0])));
        assert_eq!(buf.num_samples(), 2);
    }
}
