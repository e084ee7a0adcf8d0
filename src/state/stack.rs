//! Nested attribute stacks.
//!
//! A stack attribute holds its current size as an `Int` (`Null` when the
//! stack is empty). The frame pushed at depth `d`, counting from 0, is the
//! child attribute named `"d"`: pushing when the stack holds `d` frames sets
//! child `"d"` to the pushed value, popping resets the top frame to `Null`.
//!
//! ```text
//! CallStack      null | 1     | 2     | 1     | null
//! CallStack/0    null | "foo" | "foo" | "foo" | null
//! CallStack/1    null | null  | "bar" | null  | null
//!                     t0      t1      t2      t3
//! ```

use log::warn;

use super::attribute::{AttributeTree, Quark};
use super::store::IntervalStore;
use super::value::StateValue;
use super::StateSystemError;

fn stack_size(store: &IntervalStore, quark: Quark) -> Result<usize, StateSystemError> {
    match store.ongoing(quark)? {
        StateValue::Null => Ok(0),
        StateValue::Int(n) if n >= 0 => Ok(n as usize),
        _ => Err(StateSystemError::NotAStack(quark)),
    }
}

fn size_value(size: usize) -> StateValue {
    match size {
        0 => StateValue::Null,
        n => StateValue::Int(n as i32),
    }
}

/// Pushes `value` on the stack held by `quark`. Returns the new stack size.
pub(crate) fn push(
    tree: &mut AttributeTree,
    store: &mut IntervalStore,
    time: u64,
    value: StateValue,
    quark: Quark,
) -> Result<usize, StateSystemError> {
    let size = stack_size(store, quark)?;

    let frame = tree.get_or_create_quark(Some(quark), &size.to_string())?;
    store.ensure_attributes(tree.len());

    store.modify(time, size_value(size + 1), quark)?;
    store.modify(time, value, frame)?;

    Ok(size + 1)
}

/// Pops the top frame of the stack held by `quark` and returns its value.
/// Popping an empty stack is ignored.
pub(crate) fn pop(
    tree: &AttributeTree,
    store: &mut IntervalStore,
    time: u64,
    quark: Quark,
) -> Result<Option<StateValue>, StateSystemError> {
    let size = stack_size(store, quark)?;

    if size == 0 {
        warn!(
            "Pop on empty stack {} at {}, ignoring",
            tree.full_path_string(quark),
            time
        );
        return Ok(None);
    }

    let frame = tree
        .opt_quark(Some(quark), &(size - 1).to_string())
        .ok_or(StateSystemError::NotAStack(quark))?;

    store.modify(time, size_value(size - 1), quark)?;
    let popped = store.modify(time, StateValue::Null, frame)?;

    Ok(Some(popped))
}

/// Returns the value of the top frame of the stack held by `quark`.
pub(crate) fn peek(
    tree: &AttributeTree,
    store: &IntervalStore,
    quark: Quark,
) -> Result<Option<StateValue>, StateSystemError> {
    let size = stack_size(store, quark)?;

    if size == 0 {
        return Ok(None);
    }

    match tree.opt_quark(Some(quark), &(size - 1).to_string()) {
        Some(frame) => Ok(Some(store.ongoing(frame)?)),
        None => Err(StateSystemError::NotAStack(quark)),
    }
}

/// Number of frames on the stack held by `quark`.
pub(crate) fn depth(store: &IntervalStore, quark: Quark) -> Result<usize, StateSystemError> {
    stack_size(store, quark)
}

#[cfg(test)]
mod tests {
    use super::{depth, peek, pop, push};
    use crate::state::attribute::AttributeTree;
    use crate::state::store::IntervalStore;
    use crate::state::value::StateValue;
    use crate::state::StateSystemError;

    fn setup() -> (AttributeTree, IntervalStore) {
        (AttributeTree::new(), IntervalStore::new(0))
    }

    #[test]
    fn test_push_pop_balance() {
        let (mut tree, mut store) = setup();
        let cs = tree.quark_absolute_and_add(&["CallStack"]).unwrap();
        store.ensure_attributes(tree.len());

        assert_eq!(push(&mut tree, &mut store, 1, "foo".into(), cs), Ok(1));
        assert_eq!(push(&mut tree, &mut store, 2, "bar".into(), cs), Ok(2));
        assert_eq!(peek(&tree, &store, cs), Ok(Some("bar".into())));

        assert_eq!(pop(&tree, &mut store, 3, cs), Ok(Some("bar".into())));
        assert_eq!(pop(&tree, &mut store, 4, cs), Ok(Some("foo".into())));
        assert_eq!(depth(&store, cs), Ok(0));
        assert_eq!(store.ongoing(cs), Ok(StateValue::Null));

        let bottom = tree.opt_quark_relative(cs, &["0"]).unwrap();
        let at_3 = store.query(3, bottom).unwrap().unwrap();
        assert_eq!((at_3.start, at_3.end), (1, Some(4)));
        assert_eq!(at_3.value, StateValue::from("foo"));
    }

    #[test]
    fn test_pop_empty_stack() {
        let (mut tree, mut store) = setup();
        let cs = tree.quark_absolute_and_add(&["CallStack"]).unwrap();
        store.ensure_attributes(tree.len());

        assert_eq!(pop(&tree, &mut store, 5, cs), Ok(None));
        assert_eq!(depth(&store, cs), Ok(0));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_same_timestamp_frame() {
        let (mut tree, mut store) = setup();
        let cs = tree.quark_absolute_and_add(&["CallStack"]).unwrap();
        store.ensure_attributes(tree.len());

        push(&mut tree, &mut store, 7, "tick".into(), cs).unwrap();
        pop(&tree, &mut store, 7, cs).unwrap();

        let frame = tree.opt_quark_relative(cs, &["0"]).unwrap();
        let frames = store.range(frame, 7, 7).unwrap();

        assert!(frames
            .iter()
            .any(|i| i.start == 7 && i.end == Some(7) && i.value == StateValue::from("tick")));
    }

    #[test]
    fn test_not_a_stack() {
        let (mut tree, mut store) = setup();
        let q = tree.quark_absolute_and_add(&["name"]).unwrap();
        store.ensure_attributes(tree.len());
        store.modify(1, "main".into(), q).unwrap();

        assert_eq!(
            push(&mut tree, &mut store, 2, "foo".into(), q),
            Err(StateSystemError::NotAStack(q))
        );
    }
}
