//! Actor class registry.
//!
//! Every rank constructs its factory and registers the same actor classes
//! in the same order, so a registration index identifies a class across
//! the whole cluster. Birth requests carry that index on the wire; the
//! receiving rank turns it back into a constructor call.

use crate::{actor::Actor, transport::Transport, Error};
use std::any::{type_name, TypeId};

type Constructor<T> = fn() -> Box<dyn Actor<T>>;

fn construct<T: Transport, A: Actor<T> + Default>() -> Box<dyn Actor<T>> {
    Box::new(A::default())
}

/// Registry of actor classes, indexed by registration order.
pub struct Factory<T: Transport> {
    classes: Vec<(TypeId, Constructor<T>)>,
}

impl<T: Transport> Default for Factory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Factory<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
        }
    }

    /// Registers class `A` and returns its index.
    ///
    /// Registration order must match on every rank.
    pub fn register<A: Actor<T> + Default>(&mut self) -> usize {
        self.classes.push((TypeId::of::<A>(), construct::<T, A>));
        self.classes.len() - 1
    }

    /// Looks up the index assigned to class `A`.
    pub fn class_index<A: Actor<T> + Default>(&self) -> Result<usize, Error> {
        self.classes
            .iter()
            .position(|(id, _)| *id == TypeId::of::<A>())
            .ok_or(Error::ClassNotRegistered(type_name::<A>()))
    }

    /// Constructs a fresh instance of the class at `index`.
    pub fn create(&self, index: usize) -> Result<Box<dyn Actor<T>>, Error> {
        let (_, constructor) = self
            .classes
            .get(index)
            .ok_or(Error::BadClassIndex(index))?;
        Ok(constructor())
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
