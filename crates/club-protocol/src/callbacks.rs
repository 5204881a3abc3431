use std::cell::RefCell;
use std::collections::BTreeSet;

use crate::id::MemberId;

/// The user callbacks of a hub.
///
/// A callback may do anything to the hub that installed it, including
/// replacing itself or dropping the last handle. Invocation therefore moves
/// the function out of its slot for the duration of the call: a replacement
/// installed mid-call lands in the (now empty) slot instead of tearing down
/// the closure currently executing, and the original is put back only if no
/// replacement arrived. Whether the hub survived the call is tracked
/// separately, by the destroyed flag the hub shares with its handles.
#[derive(Default)]
pub struct Callbacks {
    on_insert: RefCell<Slot<dyn FnMut(BTreeSet<MemberId>)>>,
    on_remove: RefCell<Slot<dyn FnMut(BTreeSet<MemberId>)>>,
    on_receive: RefCell<Slot<dyn FnMut(MemberId, Vec<u8>)>>,
    on_receive_unreliable: RefCell<Slot<dyn FnMut(MemberId, Vec<u8>)>>,
    on_direct_connect: RefCell<Slot<dyn FnMut(MemberId)>>,
}

struct Slot<F: ?Sized> {
    func: Option<Box<F>>,
    replaced: bool,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Slot {
            func: None,
            replaced: false,
        }
    }
}

fn install<F: ?Sized>(slot: &RefCell<Slot<F>>, func: Box<F>) {
    let mut slot = slot.borrow_mut();
    slot.replaced = true;
    slot.func = Some(func);
}

fn call<F: ?Sized>(slot: &RefCell<Slot<F>>, invoke: impl FnOnce(&mut F)) {
    let taken = {
        let mut slot = slot.borrow_mut();
        slot.replaced = false;
        slot.func.take()
    };
    let Some(mut func) = taken else { return };
    invoke(&mut func);
    let mut slot = slot.borrow_mut();
    if !slot.replaced {
        slot.func = Some(func);
    }
}

impl Callbacks {
    pub fn set_on_insert(&self, func: Box<dyn FnMut(BTreeSet<MemberId>)>) {
        install(&self.on_insert, func);
    }

    pub fn set_on_remove(&self, func: Box<dyn FnMut(BTreeSet<MemberId>)>) {
        install(&self.on_remove, func);
    }

    pub fn set_on_receive(&self, func: Box<dyn FnMut(MemberId, Vec<u8>)>) {
        install(&self.on_receive, func);
    }

    pub fn set_on_receive_unreliable(&self, func: Box<dyn FnMut(MemberId, Vec<u8>)>) {
        install(&self.on_receive_unreliable, func);
    }

    /// Reserved hook: installable, but nothing fires it yet.
    pub fn set_on_direct_connect(&self, func: Box<dyn FnMut(MemberId)>) {
        install(&self.on_direct_connect, func);
    }

    pub fn insert(&self, members: BTreeSet<MemberId>) {
        call(&self.on_insert, |f| f(members));
    }

    pub fn remove(&self, members: BTreeSet<MemberId>) {
        call(&self.on_remove, |f| f(members));
    }

    pub fn receive(&self, from: MemberId, payload: Vec<u8>) {
        call(&self.on_receive, |f| f(from, payload));
    }

    pub fn receive_unreliable(&self, from: MemberId, payload: Vec<u8>) {
        call(&self.on_receive_unreliable, |f| f(from, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn member(n: u128) -> MemberId {
        MemberId::from_bytes(n.to_be_bytes())
    }

    #[test]
    fn uninstalled_callback_is_a_no_op() {
        let callbacks = Callbacks::default();
        callbacks.receive(member(1), b"ignored".to_vec());
    }

    #[test]
    fn installed_callback_fires_every_time() {
        let callbacks = Callbacks::default();
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        callbacks.set_on_receive(Box::new(move |_, _| seen.set(seen.get() + 1)));

        callbacks.receive(member(1), b"one".to_vec());
        callbacks.receive(member(1), b"two".to_vec());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn replacement_installed_mid_call_takes_over() {
        let callbacks = Rc::new(Callbacks::default());
        let old_calls = Rc::new(Cell::new(0));
        let new_calls = Rc::new(Cell::new(0));

        let cb = callbacks.clone();
        let old = old_calls.clone();
        let new = new_calls.clone();
        callbacks.set_on_receive(Box::new(move |_, _| {
            old.set(old.get() + 1);
            let new = new.clone();
            cb.set_on_receive(Box::new(move |_, _| new.set(new.get() + 1)));
        }));

        callbacks.receive(member(1), b"first".to_vec());
        callbacks.receive(member(1), b"second".to_vec());

        assert_eq!(old_calls.get(), 1);
        assert_eq!(new_calls.get(), 1);
    }

    #[test]
    fn mid_call_replacement_survives_the_running_closure() {
        let callbacks = Rc::new(Callbacks::default());
        let calls = Rc::new(Cell::new(0));

        let cb = callbacks.clone();
        let counted = calls.clone();
        callbacks.set_on_insert(Box::new(move |_| {
            counted.set(counted.get() + 1);
            // Installing a fresh no-op handler counts as a replacement;
            // the closure currently running must still finish safely.
            cb.set_on_insert(Box::new(|_| {}));
        }));

        callbacks.insert(BTreeSet::from([member(2)]));
        callbacks.insert(BTreeSet::from([member(3)]));

        assert_eq!(calls.get(), 1);
    }
}
