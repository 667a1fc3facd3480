//! Ring buffer of sampled auxiliary fields for back-propagation.

use num_complex::Complex64;

use crate::error::Result;
use crate::walkers::buffer::{push_real, BufferReader};

/// Auxiliary-field history of one walker.
///
/// Rows are propagation steps, columns are fields (one per basis site). The
/// buffer holds `nprop_tot` rows split into blocks of `nbp` rows; `block` is the
/// most recently completed block, `None` until the first one fills up. Each
/// row also keeps the cosine factor applied by the phaseless projection and
/// the phase factor it dropped, so estimators can restore them.
#[derive(Clone, Debug)]
pub struct FieldConfig {
    nfields: usize,
    nprop_tot: usize,
    nbp: usize,
    nblock: usize,
    configs: Vec<Complex64>,
    cos_fac: Vec<f64>,
    weight_fac: Vec<Complex64>,
    step: usize,
    ib: usize,
    block: Option<usize>,
}

impl FieldConfig {
    pub fn new(nfields: usize, nprop_tot: usize, nbp: usize) -> Self {
        let nbp = nbp.max(1);
        let nprop_tot = nprop_tot.max(nbp);
        Self {
            nfields,
            nprop_tot,
            nbp,
            nblock: (nprop_tot / nbp).max(1),
            configs: vec![Complex64::new(0.0, 0.0); nprop_tot * nfields],
            cos_fac: vec![1.0; nprop_tot],
            weight_fac: vec![Complex64::new(1.0, 0.0); nprop_tot],
            step: 0,
            ib: 0,
            block: None,
        }
    }

    /// Row the next field lands in.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn completed_block(&self) -> Option<usize> {
        self.block
    }

    /// Store a single field; a row completes after `nfields` pushes.
    pub fn push(&mut self, value: Complex64) {
        if self.ib == 0 {
            self.cos_fac[self.step] = 1.0;
            self.weight_fac[self.step] = Complex64::new(1.0, 0.0);
        }
        self.configs[self.step * self.nfields + self.ib] = value;
        self.ib = (self.ib + 1) % self.nfields;
        if self.ib == 0 {
            self.advance_row();
        }
    }

    /// Store a whole row at once. Missing trailing fields (a walker that died
    /// mid-step) are recorded as zero.
    pub fn push_full(&mut self, fields: &[Complex64], cfac: f64, wfac: Complex64) {
        let row = &mut self.configs[self.step * self.nfields..(self.step + 1) * self.nfields];
        for (k, slot) in row.iter_mut().enumerate() {
            *slot = fields.get(k).copied().unwrap_or_default();
        }
        self.cos_fac[self.step] = cfac;
        self.weight_fac[self.step] = wfac;
        self.ib = 0;
        self.advance_row();
    }

    fn advance_row(&mut self) {
        self.step = (self.step + 1) % self.nprop_tot;
        if self.step % self.nbp == 0 {
            self.block = Some(self.block.map_or(0, |b| (b + 1) % self.nblock));
        }
    }

    /// Rows of the last completed block, oldest first.
    pub fn block_rows(&self) -> Vec<&[Complex64]> {
        let b = self.block.unwrap_or(0);
        (b * self.nbp..(b + 1) * self.nbp)
            .map(|row| &self.configs[row * self.nfields..(row + 1) * self.nfields])
            .collect()
    }

    /// Products of the cosine and dropped-phase factors over the last completed block.
    pub fn block_factors(&self) -> (f64, Complex64) {
        let b = self.block.unwrap_or(0);
        let rows = b * self.nbp..(b + 1) * self.nbp;
        let cfac = self.cos_fac[rows.clone()].iter().product();
        let wfac = self.weight_fac[rows].iter().product();
        (cfac, wfac)
    }

    pub fn reset(&mut self) {
        self.configs.iter_mut().for_each(|c| *c = Complex64::new(0.0, 0.0));
        self.cos_fac.iter_mut().for_each(|c| *c = 1.0);
        self.weight_fac.iter_mut().for_each(|w| *w = Complex64::new(1.0, 0.0));
        self.step = 0;
        self.ib = 0;
        self.block = None;
    }

    pub(crate) fn pack(&self, buf: &mut Vec<Complex64>) {
        buf.extend_from_slice(&self.configs);
        self.cos_fac.iter().for_each(|&c| push_real(buf, c));
        buf.extend_from_slice(&self.weight_fac);
        push_real(buf, self.step as f64);
        push_real(buf, self.ib as f64);
        push_real(buf, self.block.map_or(-1.0, |b| b as f64));
    }

    pub(crate) fn unpack(&mut self, reader: &mut BufferReader) -> Result<()> {
        reader.slice_into(&mut self.configs)?;
        for c in self.cos_fac.iter_mut() {
            *c = reader.real()?;
        }
        reader.slice_into(&mut self.weight_fac)?;
        self.step = reader.index()?;
        self.ib = reader.index()?;
        let block = reader.real()?;
        self.block = (block >= 0.0).then(|| block.round() as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64) -> Complex64 {
        Complex64::new(x, 0.0)
    }

    #[test]
    fn test_push_wraps_and_tracks_blocks() {
        let mut fc = FieldConfig::new(2, 4, 2);
        assert_eq!(fc.completed_block(), None);
        for k in 0..4 {
            fc.push(c(k as f64));
        }
        assert_eq!(fc.step(), 2);
        assert_eq!(fc.completed_block(), Some(0));
        assert_eq!(fc.block_rows(), vec![&[c(0.0), c(1.0)][..], &[c(2.0), c(3.0)][..]]);
        for k in 4..8 {
            fc.push(c(k as f64));
        }
        assert_eq!(fc.step(), 0);
        assert_eq!(fc.completed_block(), Some(1));
        fc.push_full(&[c(9.0)], 0.5, c(-1.0));
        assert_eq!(fc.step(), 1);
        assert_eq!(fc.block_rows()[0], &[c(4.0), c(5.0)][..]);
    }

    #[test]
    fn test_block_factors_and_padding() {
        let mut fc = FieldConfig::new(3, 2, 2);
        fc.push_full(&[c(1.0)], 0.5, Complex64::new(0.0, 1.0));
        fc.push_full(&[c(1.0), c(2.0), c(3.0)], 0.5, Complex64::new(0.0, 1.0));
        let rows = fc.block_rows();
        assert_eq!(rows[0], &[c(1.0), c(0.0), c(0.0)][..]);
        let (cfac, wfac) = fc.block_factors();
        assert_eq!(cfac, 0.25);
        assert_eq!(wfac, c(-1.0));
        fc.reset();
        assert_eq!(fc.completed_block(), None);
        assert_eq!(fc.block_factors(), (1.0, c(1.0)));
    }
}
