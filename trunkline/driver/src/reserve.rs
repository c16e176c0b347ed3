use log::{debug, warn};

use crate::error::Result;

type Release<'a> = Box<dyn FnOnce() + 'a>;

/// An all-or-nothing acquisition of several dependent resources.
///
/// Each [`step`](Reservation::step) acquires one resource and records how
/// to release it. Dropping the reservation without calling
/// [`commit`](Reservation::commit) releases everything acquired so far, most
/// recent first, so a `?` on a failed step unwinds the rest.
///
pub struct Reservation<'a> {
    name: &'static str,
    acquired: Vec<(&'static str, Release<'a>)>,
}

impl<'a> Reservation<'a> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            acquired: Vec::new(),
        }
    }

    pub fn step<T, A, R>(&mut self, step: &'static str, acquire: A, release: R) -> Result<T>
    where
        A: FnOnce() -> Result<T>,
        R: FnOnce() + 'a,
    {
        match acquire() {
            Ok(value) => {
                debug!("{}: {step} acquired", self.name);
                self.acquired.push((step, Box::new(release)));
                Ok(value)
            },
            Err(e) => {
                warn!("{}: {step} failed: {e}", self.name);
                Err(e)
            },
        }
    }

    /// Keep everything acquired.
    pub fn commit(mut self) {
        self.acquired.clear();
    }

    fn unwind(&mut self) {
        while let Some((step, release)) = self.acquired.pop() {
            debug!("{}: releasing {step}", self.name);
            release();
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell;

    fn run(fail_at: Option<usize>, log: &RefCell<Vec<String>>) -> Result<()> {
        let mut reservation = Reservation::new("test");
        for n in 0..4 {
            reservation.step(
                "resource",
                || {
                    if fail_at == Some(n) {
                        return Err(Error::NotRunning);
                    }
                    log.borrow_mut().push(format!("acquire {n}"));
                    Ok(())
                },
                move || log.borrow_mut().push(format!("release {n}")),
            )?;
        }
        reservation.commit();
        Ok(())
    }

    #[test]
    fn failure_unwinds_in_reverse() {
        let log = RefCell::new(Vec::new());
        assert!(run(Some(2), &log).is_err());
        assert_eq!(log.into_inner(), vec![
            "acquire 0", "acquire 1", "release 1", "release 0",
        ]);
    }

    #[test]
    fn commit_keeps_everything() {
        let log = RefCell::new(Vec::new());
        assert!(run(None, &log).is_ok());
        assert_eq!(log.into_inner().len(), 4);
    }

    #[test]
    fn first_step_failure_releases_nothing() {
        let log = RefCell::new(Vec::new());
        assert!(run(Some(0), &log).is_err());
        assert!(log.into_inner().is_empty());
    }
}
