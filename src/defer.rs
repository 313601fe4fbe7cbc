use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::action::{Action, ActionCore};
use crate::host::HostRef;
use crate::{Error, Result};

/// The consumer work run by a primitive action.
pub type Trial = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Runs a trial on a later turn of the host.
///
/// Always reliable: a dispatched callback always runs eventually.
pub struct Defer {
    me: Weak<Defer>,
    core: ActionCore,
    host: HostRef,
    trial: RefCell<Option<Trial>>,
}

impl Defer {
    pub fn new(host: HostRef, trial: impl FnOnce() -> anyhow::Result<()> + 'static) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            core: ActionCore::new(),
            host,
            trial: RefCell::new(Some(Box::new(trial))),
        })
    }

    fn body(&self) -> Result<()> {
        let trial = self.trial.borrow_mut().take();
        settle_trial(self, trial)
    }
}

impl Action for Defer {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn reliable(&self) -> bool {
        true
    }

    fn start(&self) -> Result<()> {
        let me = self.me.upgrade().ok_or(Error::Released)?;
        self.host.dispatch(Box::new(move || me.body()))
    }
}

/// Runs the trial inside the protected region shared by the primitive actions: a normal
/// return completes well, an error completes badly.
pub(crate) fn settle_trial(action: &dyn Action, trial: Option<Trial>) -> Result<()> {
    match trial.map_or(Ok(()), |trial| trial()) {
        Ok(()) => action.end_well(),
        Err(error) => action.end_badly(Error::from_anyhow(error)),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::action::{State, catcher, finisher};
    use crate::local::LocalHost;

    #[test]
    fn trial_runs_on_next_turn() {
        let host = LocalHost::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let defer = Defer::new(host.clone(), move || {
            flag.set(true);
            Ok(())
        });

        defer.run().unwrap();
        assert_eq!(defer.state(), State::Running);
        assert!(!ran.get());

        host.run_until_stalled();
        assert!(ran.get());
        assert_eq!(defer.state(), State::Done);
    }

    #[test]
    fn failing_trial_goes_to_catcher_then_finisher() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let defer = Defer::new(host.clone(), || anyhow::bail!("boom"));

        let (catch_log, finish_log) = (Rc::clone(&log), Rc::clone(&log));
        defer
            .go(
                finisher(move || {
                    finish_log.borrow_mut().push("finisher".to_string());
                    Ok(())
                }),
                catcher(move |e| {
                    catch_log.borrow_mut().push(format!("caught {e}"));
                    Ok(())
                }),
            )
            .unwrap();
        host.run_until_stalled();

        assert_eq!(*log.borrow(), ["caught boom", "finisher"]);
        assert_eq!(defer.state(), State::Exception);
        assert!(host.take_errors().is_empty());
    }

    #[test]
    fn finisher_error_reaches_host() {
        let host = LocalHost::new();
        let defer = Defer::new(host.clone(), || Ok(()));
        defer
            .go(finisher(|| anyhow::bail!("finisher failed")), None)
            .unwrap();
        host.run_until_stalled();

        assert_eq!(defer.state(), State::Done);
        let errors = host.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "finisher failed");
    }
}
