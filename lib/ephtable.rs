//! Classification of sites as electronic or vibrational.
//!
//! Electronic sites carry occupation-number quantum numbers; vibrational
//! (phonon) sites never change the conserved excitation count. The quantum
//! number increments of each physical level are what the constrained
//! decomposition needs to group singular vectors by sector.

use std::fmt;
use serde::{ Deserialize, Serialize };

/// Provider of the electron-phonon classification of a system.
pub trait EphTable: fmt::Debug + Send + Sync {
    /// Return `true` if the `site`-th site is electronic.
    fn is_electron(&self, site: usize) -> bool;

    /// Quantum-number increments of the physical levels of an electronic
    /// site.
    ///
    /// Defaults to the occupation number of each level, `0..pdim`.
    fn electron_sigma_qn(&self, _site: usize, pdim: usize) -> Vec<i32> {
        (0..pdim as i32).collect()
    }

    /// Quantum-number increments of the physical levels of any site; zero for
    /// every level of a vibrational site.
    fn sigma_qn(&self, site: usize, pdim: usize) -> Vec<i32> {
        if self.is_electron(site) {
            self.electron_sigma_qn(site, pdim)
        } else {
            vec![0; pdim]
        }
    }
}

/// The kind of degree of freedom held at a site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteKind {
    Electron,
    Phonon,
}

/// A fixed table of site kinds.
///
/// Sites past the end of the table are treated as phonons.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTable(pub Vec<SiteKind>);

impl SiteTable {
    /// Build the table for a chain of molecules, each with one electronic site
    /// followed by `nphs` phonon sites.
    pub fn molecules(nmols: usize, nphs: usize) -> Self {
        let kinds
            = (0..nmols)
            .flat_map(|_| {
                std::iter::once(SiteKind::Electron)
                    .chain(std::iter::repeat(SiteKind::Phonon).take(nphs))
            })
            .collect();
        Self(kinds)
    }

    /// Return the number of sites in the table.
    pub fn len(&self) -> usize { self.0.len() }

    /// Return `true` if the table is empty.
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<SiteKind> for SiteTable {
    fn from_iter<I>(iter: I) -> Self
    where I: IntoIterator<Item = SiteKind>
    {
        Self(iter.into_iter().collect())
    }
}

impl EphTable for SiteTable {
    fn is_electron(&self, site: usize) -> bool {
        matches!(self.0.get(site), Some(SiteKind::Electron))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn molecule_layout() {
        let table = SiteTable::molecules(2, 2);
        assert_eq!(table.len(), 6);
        assert!(table.is_electron(0));
        assert!(!table.is_electron(1));
        assert!(table.is_electron(3));
        assert!(!table.is_electron(10));
        assert_eq!(table.sigma_qn(3, 2), vec![0, 1]);
        assert_eq!(table.sigma_qn(4, 3), vec![0, 0, 0]);
    }

    #[test]
    fn default_electron_levels_ignore_position() {
        let table = SiteTable::molecules(3, 0);
        assert_eq!(table.electron_sigma_qn(0, 3), vec![0, 1, 2]);
        assert_eq!(table.electron_sigma_qn(2, 3), table.electron_sigma_qn(0, 3));
        assert_eq!(table.sigma_qn(2, 4), vec![0, 1, 2, 3]);
    }
}
