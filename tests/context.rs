//! Context lifecycle: nesting, the environment-variable and helper
//! dictionaries, temporaries, and working-tree time.

mod common;

use anew::{Config, Context, ContextOptions, Error, TreePath};
use common::*;

#[test]
fn nested_requires_active_context() {
    let _tree = TestTree::new();
    assert!(matches!(
        Context::nested(ContextOptions::default()),
        Err(Error::NotRunning)
    ));
}

#[test]
fn out_of_order_exit_is_a_nesting_error() {
    let _tree = TestTree::new();
    let root = Context::root(Config::default()).unwrap();
    let inner = Context::nested(ContextOptions::default()).unwrap();
    let innermost = Context::nested(ContextOptions::default()).unwrap();

    // Closing a context that is not the innermost active one is fatal.
    assert!(matches!(inner.close(), Err(Error::ContextNesting)));
    innermost.close().unwrap();
    assert!(matches!(root.close(), Err(Error::ContextNesting)));
}

#[test]
fn orderly_nesting_works() {
    let _tree = TestTree::new();
    let root = Context::root(Config::default()).unwrap();
    {
        let nested = Context::nested(ContextOptions::default()).unwrap();
        assert_eq!(nested.max_parallel_redo_count(), 1);
        nested.close().unwrap();
    }
    root.close().unwrap();
}

#[test]
fn second_root_in_same_thread_is_rejected() {
    let _tree = TestTree::new();
    let root = Context::root(Config::default()).unwrap();
    assert!(Context::root(Config::default()).is_err());
    root.close().unwrap();
}

#[test]
fn no_management_directory_means_no_working_tree() {
    let tree = TestTree::new();
    std::fs::remove_dir(tree.path().join(anew::MANAGEMENT_DIR_NAME)).unwrap();
    assert!(matches!(
        Context::root(Config::default()),
        Err(Error::NoWorkingTree(_))
    ));
}

#[test]
fn foreign_lock_blocks_entry() {
    let tree = TestTree::new();
    std::fs::create_dir(tree.path().join(anew::MANAGEMENT_DIR_NAME).join("lock")).unwrap();
    let err = Context::root(Config::default()).unwrap_err();
    match err {
        Error::ManagementTree(msg) => assert!(msg.contains("cannot acquire lock")),
        other => panic!("unexpected error: {:?}", other),
    }
    // Breaking the lock (per the error's suggestion) makes the tree usable.
    std::fs::remove_dir(tree.path().join(anew::MANAGEMENT_DIR_NAME).join("lock")).unwrap();
    Context::root(Config::default()).unwrap().close().unwrap();
}

#[test]
fn env_import_validate_set_remove() {
    let _tree = TestTree::new();
    let ctx = Context::root(Config::default()).unwrap();

    // Setting an unimported variable is rejected.
    assert!(ctx.set_env("SOME_TEST_VAR", "abc").is_err());

    ctx.import_env_from_outer("SOME_TEST_VAR", "[a-z]+", "abc")
        .unwrap();
    // The process environment does not define it; still unset.
    assert_eq!(ctx.env_var("SOME_TEST_VAR"), None);

    ctx.set_env("SOME_TEST_VAR", "hello").unwrap();
    assert_eq!(ctx.env_var("SOME_TEST_VAR").as_deref(), Some("hello"));

    // The validation pattern is a full match.
    assert!(ctx.set_env("SOME_TEST_VAR", "HELLO").is_err());
    assert!(ctx.set_env("SOME_TEST_VAR", "hello1").is_err());

    ctx.remove_env("SOME_TEST_VAR").unwrap();
    assert_eq!(ctx.env_var("SOME_TEST_VAR"), None);
    assert!(ctx.remove_env("SOME_TEST_VAR").is_err());

    ctx.close().unwrap();
}

#[test]
fn import_rejects_example_not_matching_pattern() {
    let _tree = TestTree::new();
    let ctx = Context::root(Config::default()).unwrap();
    assert!(ctx
        .import_env_from_outer("SOME_TEST_VAR", "[a-z]+", "ABC")
        .is_err());
    ctx.close().unwrap();
}

#[test]
fn nested_env_snapshots_and_narrows() {
    let _tree = TestTree::new();
    let root = Context::root(Config::default()).unwrap();
    root.import_env_from_outer("SOME_TEST_VAR", "[a-z]+", "abc")
        .unwrap();
    root.set_env("SOME_TEST_VAR", "outer").unwrap();

    {
        let nested = Context::nested(ContextOptions::default()).unwrap();
        // Inherited by value.
        assert_eq!(nested.env_var("SOME_TEST_VAR").as_deref(), Some("outer"));

        // The outer context must not be modified while a nested one is
        // active.
        assert!(matches!(
            root.set_env("SOME_TEST_VAR", "other"),
            Err(Error::ContextModification(_))
        ));

        // A narrower pattern in the nested context applies on top of the
        // outer one.
        nested
            .import_env_from_outer("SOME_TEST_VAR", "[a-d]+", "abc")
            .unwrap();
        nested.set_env("SOME_TEST_VAR", "abba").unwrap();
        assert!(nested.set_env("SOME_TEST_VAR", "zzz").is_err());
        nested.close().unwrap();
    }

    // Nested modifications do not leak back.
    assert_eq!(root.env_var("SOME_TEST_VAR").as_deref(), Some("outer"));
    root.close().unwrap();
}

#[test]
fn helper_registration_and_lookup() {
    let _tree = TestTree::new();
    let config = Config {
        find_helpers: Some(false),
        ..Config::default()
    };
    let ctx = Context::root(config).unwrap();

    // Nothing registered, finding disabled.
    assert_eq!(ctx.helper(&p("mytool")), None);

    ctx.register_helper(&p("mytool"), &p("/bin/sh")).unwrap();
    assert_eq!(
        ctx.helper(&p("mytool")),
        Some(std::path::PathBuf::from("/bin/sh"))
    );

    // Directory-ness of both sides must agree.
    assert!(ctx.register_helper(&d("toolbox"), &p("/bin/sh")).is_err());
    // A nested context may not re-enable finding.
    assert!(Context::nested(ContextOptions {
        find_helpers: Some(true),
        ..ContextOptions::default()
    })
    .is_err());

    // Registrations are inherited.
    {
        let nested = Context::nested(ContextOptions::default()).unwrap();
        assert_eq!(
            nested.helper(&p("mytool")),
            Some(std::path::PathBuf::from("/bin/sh"))
        );
        nested.close().unwrap();
    }
    ctx.close().unwrap();
}

#[test]
fn implicit_helper_search_uses_executable_search_paths() {
    let _tree = TestTree::new();
    let ctx = Context::root(Config::default()).unwrap();
    assert!(!ctx.executable_search_paths().is_empty());
    let sh = ctx.helper(&p("sh")).expect("sh is on the search path");
    assert!(sh.is_absolute());
    assert!(sh.ends_with("sh"));
    ctx.close().unwrap();
}

#[test]
fn temporaries_are_scoped_and_cleaned() {
    let tree = TestTree::new();
    let scratch = tree
        .path()
        .join(anew::MANAGEMENT_DIR_NAME)
        .join("t");
    let ctx = Context::root(Config::default()).unwrap();

    let kept;
    {
        let tmp = ctx.temporary("", ".o", false).unwrap();
        assert!(tmp.path().starts_with(&scratch));
        assert!(tmp.path().is_file());
        kept = tmp.path().to_path_buf();
    }
    // Removed when the guard drops.
    assert!(!kept.exists());

    let dir_tmp = ctx.temporary("", "", true).unwrap();
    assert!(dir_tmp.path().is_dir());
    let leaked = dir_tmp.path().to_path_buf();
    std::mem::forget(dir_tmp);
    assert!(leaked.exists());

    ctx.close().unwrap();
    // Whatever was left over went away with the scratch directory.
    assert!(!leaked.exists());
    assert!(!scratch.exists());
}

#[test]
fn working_tree_time_does_not_go_backwards() {
    let _tree = TestTree::new();
    let ctx = Context::root(Config::default()).unwrap();
    let mut last = ctx.working_tree_time_ns().unwrap();
    for _ in 0..5 {
        let t = ctx.working_tree_time_ns().unwrap();
        assert!(t >= last);
        last = t;
    }
    ctx.close().unwrap();
}

#[test]
fn case_sensitivity_is_probed() {
    let _tree = TestTree::new();
    let ctx = Context::root(Config::default()).unwrap();
    // No assertion on the value (platform-dependent); it must merely be
    // consistent across queries.
    assert_eq!(
        ctx.is_working_tree_case_sensitive(),
        ctx.is_working_tree_case_sensitive()
    );
    ctx.close().unwrap();
}

#[test]
fn run_summaries_accumulate() {
    let _tree = TestTree::new();

    let config = Config {
        run_summary_max_count: 3,
        ..Config::default()
    };
    let ctx = Context::root(config).unwrap();
    assert!(ctx.summary_of_latest_runs(5).unwrap().is_empty());
    ctx.close().unwrap();

    let ctx = Context::root(Config::default()).unwrap();
    let summaries = ctx.summary_of_latest_runs(5).unwrap();
    assert_eq!(summaries.len(), 1);
    ctx.close().unwrap();

    let ctx = Context::root(Config::default()).unwrap();
    assert_eq!(ctx.summary_of_latest_runs(5).unwrap().len(), 2);
    assert_eq!(ctx.summary_of_latest_runs(1).unwrap().len(), 1);
    ctx.close().unwrap();
}

#[test]
fn reserved_management_entries_are_left_alone() {
    let tree = TestTree::new();
    // An unrelated entry below the management directory must survive a
    // complete run.
    let reserved = tree.path().join(anew::MANAGEMENT_DIR_NAME).join("u");
    std::fs::create_dir(&reserved).unwrap();
    std::fs::write(reserved.join("keep.txt"), b"mine").unwrap();

    let ctx = Context::root(Config::default()).unwrap();
    ctx.close().unwrap();

    assert_eq!(std::fs::read(reserved.join("keep.txt")).unwrap(), b"mine");
}

#[test]
fn managed_paths_may_not_reach_into_management_tree() {
    let tree = TestTree::new();
    let class = anew::ToolClass::builder("Touch")
        .role("destination_file", anew::Role::output_file())
        .redo(|_redo| async move { Ok(false) })
        .build()
        .unwrap();
    let bad = class
        .instantiate(vec![(
            "destination_file",
            TreePath::new(".anewroot/runs.sqlite").unwrap().into(),
        )])
        .unwrap();

    let ctx = Context::root(Config::default()).unwrap();
    assert!(matches!(bad.start(false), Err(Error::Dependency(_))));
    ctx.close().unwrap();
    let _ = &tree;
}
