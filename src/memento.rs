/// Snapshot and restore of a component's mutable state, for an undo/redo
/// collaborator. Restoring a memento must reproduce the state it was taken
/// from exactly.
pub trait Memorable {
    type Memento: Clone + PartialEq + std::fmt::Debug;

    fn create_memento(&self) -> Self::Memento;

    fn set_memento(&mut self, memento: Self::Memento);
}
