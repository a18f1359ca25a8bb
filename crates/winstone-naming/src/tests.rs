//! Unit tests for winstone-naming

use std::sync::Arc;
use std::thread;

use crate::{CompositeName, LinkRef, NamingContext, NamingError, NamingValue, ROOT_NAME};

fn string_at(ctx: &NamingContext, name: &str) -> String {
    ctx.lookup(name)
        .unwrap()
        .downcast_ref::<String>()
        .cloned()
        .expect("bound value should be a String")
}

// ============================================================================
// Lookup / bind
// ============================================================================

#[test]
fn bind_then_lookup_returns_value() {
    let root = NamingContext::new_root(None);
    root.bind_object("greeting", "hello".to_string()).unwrap();
    assert_eq!(string_at(&root, "greeting"), "hello");
}

#[test]
fn lookup_missing_name_fails() {
    let root = NamingContext::new_root(None);
    let err = root.lookup("missing").unwrap_err();
    assert_eq!(err, NamingError::NameNotFound(format!("{ROOT_NAME}/missing")));
}

#[test]
fn bind_twice_fails_but_rebind_overwrites() {
    let root = NamingContext::new_root(None);
    root.bind_object("k", "one".to_string()).unwrap();

    let err = root.bind_object("k", "two".to_string()).unwrap_err();
    assert!(matches!(err, NamingError::NameAlreadyBound(_)));
    assert_eq!(string_at(&root, "k"), "one");

    root.rebind_object("k", "two".to_string()).unwrap();
    assert_eq!(string_at(&root, "k"), "two");
}

#[test]
fn multi_segment_name_requires_context() {
    let root = NamingContext::new_root(None);
    root.bind_object("leaf", 1_i32).unwrap();

    let err = root.lookup("leaf/child").unwrap_err();
    assert!(matches!(err, NamingError::NotAContext(_)));

    let err = root.lookup("absent/child").unwrap_err();
    assert!(matches!(err, NamingError::NameNotFound(_)));
}

#[test]
fn nested_bind_and_lookup() {
    let root = NamingContext::new_root(None);
    root.create_subcontext("jdbc").unwrap();
    root.create_subcontext("jdbc/pools").unwrap();
    root.bind_object("jdbc/pools/main", 7_u64).unwrap();

    let value = root.lookup("jdbc/pools/main").unwrap();
    assert_eq!(value.downcast_ref::<u64>(), Some(&7));
}

#[test]
fn absolute_names_resolve_against_root() {
    let root = NamingContext::new_root(None);
    root.bind_object("x", 1_i32).unwrap();

    for name in ["java:comp/env/x", "java:/comp/env/x", "x"] {
        let value = root.lookup(name).unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&1), "lookup of {name}");
    }
}

#[test]
fn absolute_name_outside_root_is_not_found() {
    let root = NamingContext::new_root(None);
    let err = root.lookup("java:comp/UserTransaction").unwrap_err();
    assert!(matches!(err, NamingError::NameNotFound(_)));
}

#[test]
fn child_delegates_foreign_absolute_names_to_parent() {
    let root = NamingContext::new_root(None);
    let jdbc = root.create_subcontext("jdbc").unwrap();
    root.bind_object("mail", "smtp".to_string()).unwrap();

    // Outside the child's subtree: resolved by the parent.
    assert_eq!(string_at(&jdbc, "java:comp/env/mail"), "smtp");

    // Inside the child's subtree: rewritten relative to the child.
    jdbc.bind_object("main", 3_i32).unwrap();
    let value = jdbc.lookup("java:comp/env/jdbc/main").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&3));
    assert_eq!(jdbc.name_in_namespace(), "java:/comp/env/jdbc");
}

#[test]
fn empty_lookup_returns_view_with_shared_bindings() {
    let root = NamingContext::new_root(None);
    root.add_to_environment("k", "v").unwrap();

    let view = match root.lookup("").unwrap() {
        NamingValue::Context(ctx) => ctx,
        other => panic!("expected context, got {other:?}"),
    };

    // Bindings are shared.
    view.bind_object("shared", 1_i32).unwrap();
    assert!(root.lookup("shared").is_ok());

    // Environment is an independent copy.
    assert_eq!(view.environment().get("k").map(String::as_str), Some("v"));
    view.add_to_environment("k", "changed").unwrap();
    assert_eq!(root.environment().get("k").map(String::as_str), Some("v"));
}

// ============================================================================
// Unbind / rename
// ============================================================================

#[test]
fn unbind_then_lookup_fails() {
    let root = NamingContext::new_root(None);
    root.bind_object("a", 1_i32).unwrap();
    root.unbind("a").unwrap();
    assert!(matches!(
        root.lookup("a").unwrap_err(),
        NamingError::NameNotFound(_)
    ));
}

#[test]
fn unbind_absent_leaf_is_idempotent() {
    let root = NamingContext::new_root(None);
    root.unbind("never-bound").unwrap();
    root.unbind("never-bound").unwrap();
}

#[test]
fn unbind_requires_intermediate_contexts() {
    let root = NamingContext::new_root(None);
    let err = root.unbind("missing/leaf").unwrap_err();
    assert!(matches!(err, NamingError::NameNotFound(_)));
}

#[test]
fn rename_moves_binding() {
    let root = NamingContext::new_root(None);
    root.bind_object("a", "X".to_string()).unwrap();
    root.bind_object("b", "Y".to_string()).unwrap();

    root.rename("a", "c").unwrap();

    assert_eq!(string_at(&root, "c"), "X");
    assert_eq!(string_at(&root, "b"), "Y");
    assert!(matches!(
        root.lookup("a").unwrap_err(),
        NamingError::NameNotFound(_)
    ));
}

#[test]
fn rename_onto_bound_name_fails_atomically() {
    let root = NamingContext::new_root(None);
    root.bind_object("a", "X".to_string()).unwrap();
    root.bind_object("b", "Y".to_string()).unwrap();

    let err = root.rename("a", "b").unwrap_err();
    assert!(matches!(err, NamingError::NameAlreadyBound(_)));
    assert_eq!(string_at(&root, "a"), "X");
    assert_eq!(string_at(&root, "b"), "Y");
}

#[test]
fn rename_across_contexts_is_not_supported() {
    let root = NamingContext::new_root(None);
    root.create_subcontext("one").unwrap();
    root.create_subcontext("two").unwrap();
    root.bind_object("one/x", 1_i32).unwrap();

    let err = root.rename("one/x", "two/x").unwrap_err();
    assert!(matches!(err, NamingError::OperationNotSupported(_)));
    assert!(root.lookup("one/x").is_ok());
}

#[test]
fn rename_within_subcontext() {
    let root = NamingContext::new_root(None);
    root.create_subcontext("app").unwrap();
    root.bind_object("app/old", 5_i32).unwrap();

    root.rename("app/old", "app/new").unwrap();
    assert!(root.lookup("app/new").is_ok());
    assert!(root.lookup("app/old").is_err());
}

// ============================================================================
// Sub-contexts and enumeration
// ============================================================================

#[test]
fn list_subcontext_yields_single_entry() {
    let root = NamingContext::new_root(None);
    root.create_subcontext("app").unwrap();
    root.bind_object("app/cfg", 42_i32).unwrap();

    let entries: Vec<_> = root.list("app").unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "cfg");
    assert_eq!(entries[0].class_name, "i32");
}

#[test]
fn list_bindings_yields_values() {
    let root = NamingContext::new_root(None);
    root.bind_object("a", 1_i32).unwrap();
    root.bind_object("b", 2_i32).unwrap();

    let mut total = 0;
    for binding in root.list_bindings("").unwrap() {
        total += binding.value.downcast_ref::<i32>().copied().unwrap_or(0);
    }
    assert_eq!(total, 3);
}

#[test]
fn list_of_leaf_is_not_a_context() {
    let root = NamingContext::new_root(None);
    root.bind_object("leaf", 1_i32).unwrap();
    assert!(matches!(
        root.list("leaf").unwrap_err(),
        NamingError::NotAContext(_)
    ));
}

#[test]
fn enumeration_is_a_snapshot() {
    let root = NamingContext::new_root(None);
    root.bind_object("a", 1_i32).unwrap();

    let names = root.list("").unwrap();
    root.bind_object("b", 2_i32).unwrap();

    assert_eq!(names.count(), 1);
}

#[test]
fn create_subcontext_on_occupied_name_fails() {
    let root = NamingContext::new_root(None);
    root.bind_object("taken", 1_i32).unwrap();
    assert!(matches!(
        root.create_subcontext("taken").unwrap_err(),
        NamingError::NameAlreadyBound(_)
    ));
}

#[test]
fn destroy_subcontext_closes_child() {
    let root = NamingContext::new_root(None);
    let child = root.create_subcontext("tmp").unwrap();

    root.destroy_subcontext("tmp").unwrap();

    assert!(child.is_closed());
    assert!(root.lookup("tmp").is_err());
    assert!(matches!(
        child.lookup("x").unwrap_err(),
        NamingError::Closed(_)
    ));
}

#[test]
fn destroy_subcontext_of_self_is_invalid() {
    let root = NamingContext::new_root(None);
    assert!(matches!(
        root.destroy_subcontext("").unwrap_err(),
        NamingError::InvalidName(_)
    ));
    assert!(matches!(
        root.destroy_subcontext(ROOT_NAME).unwrap_err(),
        NamingError::InvalidName(_)
    ));
}

#[test]
fn subcontext_inherits_environment_copy() {
    let root = NamingContext::new_root(None);
    root.add_to_environment("provider", "winstone").unwrap();
    let child = root.create_subcontext("child").unwrap();

    assert_eq!(
        child.environment().get("provider").map(String::as_str),
        Some("winstone")
    );
    child.remove_from_environment("provider").unwrap();
    assert!(root.environment().contains_key("provider"));
}

// ============================================================================
// Links
// ============================================================================

#[test]
fn lookup_link_fails_once_target_is_gone() {
    let root = NamingContext::new_root(None);
    root.bind_object("aaaa", "target".to_string()).unwrap();
    root.bind("linka", LinkRef::new("aaaa")).unwrap();

    let followed = root.lookup_link("linka").unwrap();
    assert_eq!(followed.downcast_ref::<String>().map(String::as_str), Some("target"));

    root.unbind("aaaa").unwrap();

    assert!(matches!(
        root.lookup_link("linka").unwrap_err(),
        NamingError::NameNotFound(_)
    ));
    let raw = root.lookup("linka").unwrap();
    assert_eq!(raw.as_link().map(LinkRef::link_name), Some("aaaa"));
}

#[test]
fn relative_link_resolves_in_holding_context() {
    let root = NamingContext::new_root(None);
    let app = root.create_subcontext("app").unwrap();
    app.bind_object("real", 9_i32).unwrap();
    app.bind("alias", LinkRef::new("./real")).unwrap();

    let value = root.lookup_link("app/alias").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&9));
}

#[test]
fn absolute_link_resolves_from_root() {
    let root = NamingContext::new_root(None);
    let app = root.create_subcontext("app").unwrap();
    root.bind_object("shared", 4_i32).unwrap();
    app.bind("alias", LinkRef::new("java:comp/env/shared")).unwrap();

    let value = app.lookup_link("alias").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&4));
}

#[test]
fn chained_absolute_links_are_followed() {
    let root = NamingContext::new_root(None);
    root.bind_object("end", 1_i32).unwrap();
    root.bind("middle", LinkRef::new("end")).unwrap();
    root.bind("start", LinkRef::new("middle")).unwrap();

    let value = root.lookup_link("start").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&1));
}

#[test]
fn relative_link_to_another_link_is_followed() {
    let root = NamingContext::new_root(None);
    let app = root.create_subcontext("app").unwrap();
    root.bind_object("target", 5_i32).unwrap();
    app.bind("shared", LinkRef::new("java:comp/env/target")).unwrap();
    app.bind("alias", LinkRef::new("./shared")).unwrap();

    let value = root.lookup_link("app/alias").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&5));
}

#[test]
fn relative_link_cycle_is_detected() {
    let root = NamingContext::new_root(None);
    let app = root.create_subcontext("app").unwrap();
    app.bind("ping", LinkRef::new("./pong")).unwrap();
    app.bind("pong", LinkRef::new("./ping")).unwrap();

    assert!(matches!(
        app.lookup_link("ping").unwrap_err(),
        NamingError::LinkLoop(_)
    ));
}

#[test]
fn link_cycle_is_detected() {
    let root = NamingContext::new_root(None);
    root.bind("ping", LinkRef::new("pong")).unwrap();
    root.bind("pong", LinkRef::new("ping")).unwrap();

    assert!(matches!(
        root.lookup_link("ping").unwrap_err(),
        NamingError::LinkLoop(_)
    ));
}

// ============================================================================
// Misc
// ============================================================================

#[test]
fn compose_name_joins_components() {
    let root = NamingContext::new_root(None);
    assert_eq!(root.compose_name("main", "jdbc"), "jdbc/main");
    assert_eq!(root.compose_name("a/b", ""), "a/b");
}

#[test]
fn closed_context_rejects_operations() {
    let root = NamingContext::new_root(None);
    root.close();
    assert!(matches!(
        root.bind_object("x", 1_i32).unwrap_err(),
        NamingError::Closed(_)
    ));
    assert!(matches!(
        root.lookup_name(&CompositeName::parse("x")).unwrap_err(),
        NamingError::Closed(_)
    ));
    assert!(root.environment().is_empty());
}

#[test]
fn concurrent_binds_in_separate_contexts() {
    let root = NamingContext::new_root(None);
    for i in 0..4 {
        root.create_subcontext(&format!("ctx{i}")).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let root = Arc::clone(&root);
            thread::spawn(move || {
                for j in 0..50 {
                    root.bind_object(&format!("ctx{i}/n{j}"), j).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..4 {
        assert_eq!(root.list(&format!("ctx{i}")).unwrap().count(), 50);
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

proptest! {
    /// Property: bind followed by lookup returns the bound value.
    #[test]
    fn prop_bind_lookup_round_trip(
        segments in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..4),
        value in any::<i64>(),
    ) {
        let root = NamingContext::new_root(None);
        for depth in 1..segments.len() {
            let path = segments[..depth].join("/");
            if root.lookup(&path).is_err() {
                root.create_subcontext(&path).unwrap();
            }
        }
        let name = segments.join("/");
        root.bind_object(&name, value).unwrap();

        let found = root.lookup(&name).unwrap();
        prop_assert_eq!(found.downcast_ref::<i64>(), Some(&value));

        let absolute = format!("java:comp/env/{name}");
        let found = root.lookup(&absolute).unwrap();
        prop_assert_eq!(found.downcast_ref::<i64>(), Some(&value));
    }

    /// Property: unbind always makes the name unresolvable.
    #[test]
    fn prop_unbind_removes(name in "[a-z]{1,8}") {
        let root = NamingContext::new_root(None);
        root.bind_object(&name, 0_u8).unwrap();
        root.unbind(&name).unwrap();
        prop_assert!(matches!(root.lookup(&name), Err(NamingError::NameNotFound(_))));
    }
}
