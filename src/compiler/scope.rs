use std::collections::HashMap;

/// Lexical scopes for one function body, innermost last.
///
/// Slot ids are never reused within a function: every scope draws from one
/// counter, so a child's ids always continue after everything its ancestors
/// (and earlier siblings) were given. A shadowing binding gets a fresh slot
/// and the outer value survives.
#[derive(Debug)]
pub struct ScopeChain {
    scopes: Vec<HashMap<String, u32>>,
    /// Next slot id to hand out.
    next_id: u32,
}

impl ScopeChain {
    /// A chain holding one root scope whose first slot is `first_slot`.
    pub fn new(first_slot: u32) -> Self {
        ScopeChain { scopes: vec![HashMap::new()], next_id: first_slot }
    }

    pub fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Close the innermost scope. The root scope is never popped.
    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Slot for `name` in the innermost scope, allocating one if the name is
    /// not bound there yet. Outer bindings are not consulted.
    pub fn declare(&mut self, name: &str) -> u32 {
        let Some(scope) = self.scopes.last_mut() else {
            unreachable!("scope chain always holds its root scope");
        };
        if let Some(&id) = scope.get(name) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        scope.insert(name.to_string(), id);
        id
    }

    /// Walk from the innermost scope outwards.
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    /// Number of slots a frame needs to hold every binding declared so far.
    pub fn slot_count(&self) -> u32 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_ids_continue_after_parent() {
        let mut chain = ScopeChain::new(1);
        let a = chain.declare("a");
        let b = chain.declare("b");
        chain.push();
        let c = chain.declare("c");
        assert!(a < b && b < c, "{a} {b} {c}");
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn redeclare_in_same_scope_reuses_slot() {
        let mut chain = ScopeChain::new(1);
        let a = chain.declare("a");
        chain.declare("b");
        assert_eq!(chain.declare("a"), a);
    }

    #[test]
    fn child_sees_parent_but_not_the_reverse() {
        let mut chain = ScopeChain::new(1);
        chain.declare("a");
        chain.declare("b");
        chain.push();
        chain.declare("c");
        assert_eq!(chain.resolve("a"), Some(1));
        assert_eq!(chain.resolve("b"), Some(2));
        chain.pop();
        assert_eq!(chain.resolve("c"), None);
        assert_eq!(chain.resolve("a"), Some(1));
    }

    #[test]
    fn shadowing_allocates_new_slot() {
        let mut chain = ScopeChain::new(1);
        let outer = chain.declare("x");
        chain.push();
        let inner = chain.declare("x");
        assert_ne!(outer, inner);
        assert_eq!(chain.resolve("x"), Some(inner));
        chain.pop();
        assert_eq!(chain.resolve("x"), Some(outer));
    }

    #[test]
    fn sibling_scope_never_collides_with_earlier_child() {
        let mut chain = ScopeChain::new(1);
        chain.declare("a");
        chain.push();
        let first = chain.declare("t");
        chain.pop();
        chain.declare("b");
        chain.push();
        let second = chain.declare("u");
        let b = chain.resolve("b").unwrap();
        assert_ne!(first, b);
        assert_ne!(second, b);
        assert_ne!(second, first);
    }

    #[test]
    fn slot_count_tracks_high_water() {
        let mut chain = ScopeChain::new(1);
        assert_eq!(chain.slot_count(), 1);
        chain.declare("a");
        chain.push();
        chain.declare("b");
        chain.declare("c");
        chain.pop();
        assert_eq!(chain.slot_count(), 4);
    }

    #[test]
    fn root_scope_is_never_popped() {
        let mut chain = ScopeChain::new(1);
        chain.declare("a");
        chain.pop();
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.resolve("a"), Some(1));
    }
}
