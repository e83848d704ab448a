//! Implicit and explicit transactions through the wrapped manager

mod common;

use common::{embedded_registry, open_store};
use hopstore::node::{Node, NodeState, SharedNode};
use hopstore::storage::OsFileOps;
use hopstore::Error;
use std::sync::Arc;

#[test]
fn test_missing_nodes_are_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), embedded_registry(), Arc::new(OsFileOps));
    let wrapped = store.wrapped();

    let key = store.registry().embedded_key("4711");
    assert!(wrapped.get_node(&key).unwrap().is_none());

    let root = wrapped.get_root_node().unwrap().unwrap();
    assert!(wrapped.get_child_by_name(&root, "nothing").unwrap().is_none());
    assert!(!store.node_manager().has_transaction());
}

#[test]
fn test_implicit_transaction_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), embedded_registry(), Arc::new(OsFileOps));
    let wrapped = store.wrapped();
    let root = wrapped.get_root_node().unwrap().unwrap();

    let before = store.metrics().transactions.committed.get();
    let child = SharedNode::new(Node::transient(Some("news"), None));
    wrapped.add_subnode(&root, &child).unwrap();

    assert!(!store.node_manager().has_transaction());
    assert_eq!(child.read().state(), NodeState::Clean);
    assert!(store.node_manager().database().exists(&child.id()));
    assert_eq!(store.metrics().transactions.committed.get(), before + 1);
}

#[test]
fn test_nested_calls_join_explicit_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), embedded_registry(), Arc::new(OsFileOps));
    let wrapped = store.wrapped();
    let root = wrapped.get_root_node().unwrap().unwrap();

    let first = SharedNode::new(Node::transient(Some("first"), None));
    let second = SharedNode::new(Node::transient(Some("second"), None));
    let before = store.metrics().transactions.committed.get();
    wrapped
        .transaction(|w| {
            w.add_subnode(&root, &first)?;
            w.add_subnode(&root, &second)?;
            // nothing is written before the outer commit
            assert_eq!(first.read().state(), NodeState::New);
            assert!(!store.node_manager().database().exists(&first.id()));
            Ok(())
        })
        .unwrap();

    assert_eq!(store.metrics().transactions.committed.get(), before + 1);
    assert!(store.node_manager().database().exists(&first.id()));
    assert!(store.node_manager().database().exists(&second.id()));
}

#[test]
fn test_failed_transaction_is_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), embedded_registry(), Arc::new(OsFileOps));
    let wrapped = store.wrapped();
    let root = wrapped.get_root_node().unwrap().unwrap();

    let child = SharedNode::new(Node::transient(Some("doomed"), None));
    let result: hopstore::Result<()> = wrapped.transaction(|w| {
        w.add_subnode(&root, &child)?;
        Err(Error::invalid_input("changed my mind"))
    });

    assert!(result.is_err());
    assert!(!store.node_manager().has_transaction());
    assert!(!store.node_manager().database().exists(&child.id()));
    assert_eq!(store.metrics().transactions.aborted.get(), 1);
}

#[test]
fn test_errors_name_the_operation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), embedded_registry(), Arc::new(OsFileOps));
    let wrapped = store.wrapped();

    let persistent = wrapped.get_root_node().unwrap().unwrap();
    let err = wrapped.insert_node(&persistent).unwrap_err();
    assert!(err.to_string().contains("insertNode"));
    assert!(!store.node_manager().has_transaction());
}
