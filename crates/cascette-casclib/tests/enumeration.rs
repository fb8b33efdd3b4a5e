#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Integration tests for name enumeration
//!
//! Covers pattern and plain filters, lazy cursor binding, engine failures
//! while stepping, the configured engine mask, and cascading close of bound
//! finders.

use cascette_casclib::error::codes;
use cascette_casclib::{
    CascLib, CascLibConfig, EngineError, EngineOp, MemoryArchive, MemoryEngine, Result, Storage,
    StorageKind,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn archive() -> MemoryArchive {
    MemoryArchive::new()
        .with_entry("a.txt", "a")
        .with_entry("b.dat", "b")
        .with_entry("ab.txt", "ab")
}

fn open_with(config: CascLibConfig) -> (Arc<MemoryEngine>, Storage) {
    let engine = Arc::new(MemoryEngine::new().with_archive("wow", archive()));
    let storage = CascLib::with_config(engine.clone(), config)
        .expect("valid config")
        .open("wow", StorageKind::Local)
        .expect("open storage");
    (engine, storage)
}

fn open() -> (Arc<MemoryEngine>, Storage) {
    open_with(CascLibConfig::default())
}

fn names(storage: &Storage, pattern: Option<&str>, plain: bool) -> Vec<String> {
    storage
        .files(pattern, plain)
        .expect("finder")
        .collect::<Result<_>>()
        .expect("no engine error")
}

#[test]
fn unfiltered_enumeration_lists_everything() {
    let (engine, storage) = open();
    assert_eq!(names(&storage, None, false), ["a.txt", "b.dat", "ab.txt"]);
    // Reaching the end releases the cursor.
    assert_eq!(engine.open_finds(), 0);
    assert_eq!(storage.tracked_children(), 0);
}

#[test]
fn pattern_filter() {
    let (_engine, storage) = open();
    assert_eq!(names(&storage, Some(r"\.txt$"), false), ["a.txt", "ab.txt"]);
    assert_eq!(names(&storage, Some("^a"), false), ["a.txt", "ab.txt"]);
    assert_eq!(names(&storage, Some("zzz"), false), Vec::<String>::new());
}

#[test]
fn plain_filter_is_literal() {
    let (_engine, storage) = open();
    // As a pattern "." matches any character; as plain text only a dot.
    assert_eq!(names(&storage, Some("a."), false), ["a.txt", "b.dat", "ab.txt"]);
    assert_eq!(names(&storage, Some("a."), true), ["a.txt"]);
    assert_eq!(names(&storage, Some("[a"), true), Vec::<String>::new());
}

#[test]
fn malformed_pattern_is_argument_error() {
    let (_engine, storage) = open();
    let err = storage.files(Some("(a"), false).expect_err("bad pattern");
    assert!(err.is_argument_error());
    assert!(err.code().is_none());
}

#[test]
fn binding_is_lazy() {
    let (engine, storage) = open();
    let mut finder = storage.files(None, false).expect("finder");

    assert!(!finder.is_bound());
    assert_eq!(engine.open_finds(), 0);
    assert_eq!(storage.tracked_children(), 0);

    assert_eq!(finder.next().expect("item").expect("ok"), "a.txt");
    assert!(finder.is_bound());
    assert_eq!(engine.open_finds(), 1);
    assert_eq!(storage.tracked_children(), 1);

    assert!(finder.close().expect("close bound"));
    assert_eq!(engine.open_finds(), 0);
    assert_eq!(storage.tracked_children(), 0);
    assert!(finder.next().is_none());
}

#[test]
fn closing_unbound_finder() {
    let (engine, storage) = open();
    let mut finder = storage.files(None, false).expect("finder");

    assert!(finder.close().expect_err("nothing bound").is_invalid_handle());
    assert!(!finder.is_open());
    assert!(finder.next().is_none());
    assert_eq!(engine.open_finds(), 0);
}

#[test]
fn find_first_failure_is_raised_once() {
    let (engine, storage) = open();
    engine.fail_next(EngineOp::FindFirst, EngineError::from_code(codes::ERROR_ACCESS_DENIED));

    let mut finder = storage.files(None, false).expect("finder");
    let err = finder.next().expect("error item").expect_err("denied");
    assert_eq!(err.code(), Some(codes::ERROR_ACCESS_DENIED));
    assert!(finder.next().is_none());
    assert!(!finder.is_open());
}

#[test]
fn find_next_failure_closes_cursor() {
    let (engine, storage) = open();
    let mut finder = storage.files(None, false).expect("finder");
    assert_eq!(finder.next().expect("item").expect("ok"), "a.txt");

    engine.fail_next(EngineOp::FindNext, EngineError::from_code(codes::ERROR_FILE_CORRUPT));
    let err = finder.next().expect("error item").expect_err("corrupt");
    assert_eq!(err.code(), Some(codes::ERROR_FILE_CORRUPT));

    assert!(finder.next().is_none());
    assert_eq!(engine.open_finds(), 0);
    assert_eq!(storage.tracked_children(), 0);
}

#[test]
fn failure_while_skipping_filtered_names() {
    let (engine, storage) = open();
    let mut finder = storage.files(Some("ab"), true).expect("finder");

    // The first name is rejected, so the failing call is the next one.
    engine.fail_next(EngineOp::FindNext, EngineError::from_code(codes::ERROR_READ_FAULT));
    let err = finder.next().expect("error item").expect_err("read fault");
    assert_eq!(err.code(), Some(codes::ERROR_READ_FAULT));
    assert!(finder.next().is_none());
}

#[test]
fn empty_storage_ends_without_binding() {
    let engine = Arc::new(MemoryEngine::new().with_archive("empty", MemoryArchive::new()));
    let storage = CascLib::new(engine.clone())
        .open("empty", StorageKind::Local)
        .expect("open");

    let mut finder = storage.files(None, false).expect("finder");
    assert!(finder.next().is_none());
    assert!(!finder.is_bound());
    assert_eq!(engine.open_handles(), 1);
}

#[test]
fn configured_mask_narrows_engine_results() {
    let (_engine, storage) = open_with(CascLibConfig::new().with_find_mask("*.TXT"));
    assert_eq!(names(&storage, None, false), ["a.txt", "ab.txt"]);
    assert_eq!(names(&storage, Some("^ab"), false), ["ab.txt"]);
}

#[test]
fn storage_close_cascades_to_bound_finder() {
    let (engine, storage) = open();
    let mut finder = storage.files(None, false).expect("finder");
    finder.next().expect("item").expect("ok");

    storage.close().expect("close storage");

    assert!(!finder.is_open());
    assert!(finder.to_string().ends_with(" (Closed)"));
    assert!(finder.next().is_none());
    assert_eq!(engine.open_handles(), 0);
}

#[test]
fn independent_finders_interleave() {
    let (engine, storage) = open();
    let mut txt = storage.files(Some("txt"), true).expect("finder");
    let mut all = storage.files(None, false).expect("finder");

    assert_eq!(txt.next().expect("item").expect("ok"), "a.txt");
    assert_eq!(all.next().expect("item").expect("ok"), "a.txt");
    assert_eq!(all.next().expect("item").expect("ok"), "b.dat");
    assert_eq!(txt.next().expect("item").expect("ok"), "ab.txt");
    assert_eq!(engine.open_finds(), 2);

    drop(txt);
    assert_eq!(storage.tracked_children(), 1);
    drop(all);
    assert_eq!(engine.open_finds(), 0);
}
