use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::action::{Action, ActionCore, State, WatchId, Watcher};
use crate::{Error, Result};

struct Member {
    action: Rc<dyn Action>,
    our_id: Option<WatchId>,
}

/// Completes once every member action has completed.
///
/// Completes well if all members completed well, otherwise badly with the first member
/// failure it observed. Reliable only if every member is reliable.
///
/// Each outstanding member holds the conjunction in a watcher slot while the conjunction
/// holds the member, so a conjunction that is never started and whose members never
/// complete is never freed. Completing releases every member.
pub struct JoinConjunction {
    core: ActionCore,
    members: RefCell<Vec<Member>>,
    remaining: Cell<usize>,
    failure: RefCell<Option<Error>>,
    reliable: bool,
}

impl JoinConjunction {
    pub fn new(actions: Vec<Rc<dyn Action>>) -> Result<Rc<Self>> {
        let reliable = actions.iter().all(|action| action.reliable());
        let conjunction = Rc::new(Self {
            core: ActionCore::new(),
            members: RefCell::new(Vec::with_capacity(actions.len())),
            remaining: Cell::new(actions.len()),
            failure: RefCell::new(None),
            reliable,
        });

        for (index, action) in actions.into_iter().enumerate() {
            let our_id = if action.completed() {
                conjunction.record(action.exception().ok());
                None
            } else {
                Some(action.watch(conjunction.clone(), WatchId(index))?)
            };
            conjunction
                .members
                .borrow_mut()
                .push(Member { action, our_id });
        }
        Ok(conjunction)
    }

    /// Members that have not reported yet.
    pub fn remaining(&self) -> usize {
        self.remaining.get()
    }

    fn record(&self, failure: Option<Error>) {
        self.remaining.set(self.remaining.get().saturating_sub(1));
        if let Some(failure) = failure {
            self.failure.borrow_mut().get_or_insert(failure);
        }
    }

    fn notice(&self, their_id: WatchId, failure: Option<Error>) -> anyhow::Result<()> {
        if let Some(member) = self.members.borrow_mut().get_mut(their_id.0) {
            member.our_id = None;
        }
        self.record(failure);
        trace!(member = their_id.0, remaining = self.remaining.get(), "conjunction member reported");
        if self.state() == State::Running && self.remaining.get() == 0 {
            self.finish()?;
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let failure = self.failure.borrow_mut().take();
        match failure {
            Some(error) => self.end_badly(error),
            None => self.end_well(),
        }
    }
}

impl Action for JoinConjunction {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn start(&self) -> Result<()> {
        if self.remaining.get() == 0 {
            self.finish()
        } else {
            Ok(())
        }
    }

    fn terminate(&self) {
        let members = std::mem::take(&mut *self.members.borrow_mut());
        for member in members {
            if let Some(id) = member.our_id {
                member.action.withdraw(id);
            }
        }
    }
}

impl Watcher for JoinConjunction {
    fn notice_good(&self, their_id: WatchId) -> anyhow::Result<()> {
        self.notice(their_id, None)
    }

    fn notice_bad(&self, their_id: WatchId, error: &Error) -> anyhow::Result<()> {
        self.notice(their_id, Some(error.clone()))
    }
}
