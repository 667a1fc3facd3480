//! Flat complex buffers used to move walkers between ranks and to disk.

use num_complex::Complex64;

use crate::error::{AfqmcError, Result};
use crate::linalg::CMatrix;

pub(crate) fn push_matrix(buf: &mut Vec<Complex64>, m: &CMatrix) {
    buf.extend(m.iter().copied());
}

pub(crate) fn push_real(buf: &mut Vec<Complex64>, x: f64) {
    buf.push(Complex64::new(x, 0.0));
}

/// Sequential reader over a packed walker buffer.
pub(crate) struct BufferReader<'a> {
    data: &'a [Complex64],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub(crate) fn new(data: &'a [Complex64]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [Complex64]> {
        let end = self.pos + len;
        let chunk = self.data.get(self.pos..end).ok_or(AfqmcError::CheckpointFormatMismatch {
            what: "walker buffer entries",
            expected: end,
            found: self.data.len(),
        })?;
        self.pos = end;
        Ok(chunk)
    }

    pub(crate) fn complex(&mut self) -> Result<Complex64> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn real(&mut self) -> Result<f64> {
        Ok(self.complex()?.re)
    }

    pub(crate) fn index(&mut self) -> Result<usize> {
        Ok(self.real()?.round() as usize)
    }

    pub(crate) fn matrix_into(&mut self, m: &mut CMatrix) -> Result<()> {
        let chunk = self.take(m.len())?;
        m.copy_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn slice_into(&mut self, out: &mut [Complex64]) -> Result<()> {
        let chunk = self.take(out.len())?;
        out.copy_from_slice(chunk);
        Ok(())
    }

    /// Fails unless every entry was consumed.
    pub(crate) fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(AfqmcError::CheckpointFormatMismatch {
                what: "walker buffer entries",
                expected: self.pos,
                found: self.data.len(),
            });
        }
        Ok(())
    }
}
