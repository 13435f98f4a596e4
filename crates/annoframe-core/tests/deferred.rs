#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::{path::Path, sync::Arc};

use annoframe_core::{
    ComputeError, EngineError, ErrorKind, ExecutionMode, FilterOptions, Frame, FrozenGraph, Handle,
    LocalScheduler, Mangler, NodeKind, NodeOutcome, NodeState, RowFilter, Scheduler, Session,
    SessionConfig, WriteOptions,
};
use common::{Failing, TestResult, Times, column_names, double, evens, int_column, session, xs};
use tempfile::TempDir;

fn scheduler() -> LocalScheduler {
    LocalScheduler::new(4)
}

fn frame_of(graph: &FrozenGraph, name: &str) -> Frame {
    let id = graph.table_id(name).expect("table exists");
    graph.frame(id).expect("table loaded")
}

#[tokio::test]
async fn scenario_runs_through_the_graph_with_forwarding() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 3]), vec![])?;
    assert_eq!(s.load(t)?, Handle::Load(t));
    let d = double();
    let handle = s.attach(t, d.clone())?;
    assert_eq!(
        handle,
        Handle::Annotator {
            table: t,
            cache_name: "double".into()
        }
    );
    let child = s.filter(
        t,
        "evens",
        RowFilter::function("x-is-even", evens),
        FilterOptions::default(),
    )?;
    assert!(!s.table(t)?.is_loaded(), "deferred mode must not load eagerly");
    let out = s.write(child, None, WriteOptions::default())?;

    let graph = s.build_graph()?;
    let report = scheduler().run(&graph).await?;
    assert!(report.is_success(), "{report:?}");

    let parent = frame_of(&graph, "T");
    assert_eq!(int_column(&parent, "y"), vec![2, 4, 6]);
    let evens = frame_of(&graph, "evens");
    assert_eq!(int_column(&evens, "x"), vec![2]);
    assert_eq!(int_column(&evens, "y"), vec![4]);
    assert_eq!(d.calls(), 1);

    let forward = graph
        .nodes()
        .find(|n| n.table == child && n.annotator.as_deref() == Some("double"))
        .expect("child node for double");
    assert_eq!(forward.kind, NodeKind::Forward { from: t });

    let text = std::fs::read_to_string(&out.path)?;
    assert_eq!(text.lines().next(), Some("x\tparent_row\ty"));
    Ok(())
}

#[tokio::test]
async fn table_names_are_unique_in_deferred_mode() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    s.create_table("T", xs(&[1]), vec![])?;
    let err = s.create_table("T", xs(&[1]), vec![]).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateTable { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[tokio::test]
async fn only_requested_work_is_materialized() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let a = s.create_table("A", xs(&[1, 2]), vec![])?;
    let b = s.create_table("B", xs(&[3, 4]), vec![])?;
    let da = Arc::new(Times::named("double", "x", "y", 2));
    let db = Arc::new(Times::named("double", "x", "y", 2));
    let wanted = s.attach(a, da.clone())?;
    s.attach(b, db.clone())?;

    let graph = s.build_graph()?;
    let report = scheduler().run_targets(&graph, &[wanted, Handle::Done]).await?;
    assert!(report.is_success());
    assert_eq!(report.order().len(), 2, "load and compute of A only");
    assert_eq!((da.calls(), db.calls()), (1, 0));
    assert!(graph.frame(b).is_none());
    let load_b = graph.resolve(&Handle::Load(b)).unwrap();
    assert!(matches!(graph.state(load_b), Some(NodeState::Pending)));
    Ok(())
}

#[tokio::test]
async fn failures_only_affect_dependent_nodes() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2]), vec![])?;
    let bad = s.attach(t, Arc::new(Failing::new("bad")))?;
    let good = s.attach(t, double())?;
    let written = s.write(t, None, WriteOptions::default())?;
    let u = s.create_table("U", xs(&[5]), vec![])?;
    let other = s.attach(u, Arc::new(Times::named("triple", "x", "z", 3)))?;

    let graph = s.build_graph()?;
    let report = scheduler().run(&graph).await?;
    assert!(!report.is_success());

    let bad = graph.resolve(&bad).unwrap();
    match report.outcome(bad) {
        Some(NodeOutcome::Failed(err)) => {
            assert_eq!(err.kind(), ErrorKind::Computation);
            assert!(err.to_string().contains("boom"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let annotate = graph.resolve(&Handle::Annotate(t)).unwrap();
    assert!(matches!(
        report.outcome(annotate),
        Some(NodeOutcome::Skipped { upstream }) if *upstream == bad
    ));
    let written = graph.resolve(&written.handle).unwrap();
    assert!(matches!(report.outcome(written), Some(NodeOutcome::Skipped { .. })));
    assert!(!tmp.path().join("results/T/T.tsv").exists());

    let good = graph.resolve(&good).unwrap();
    assert!(report.outcome(good).unwrap().is_success());
    let other = graph.resolve(&other).unwrap();
    assert!(report.outcome(other).unwrap().is_success());
    assert_eq!(int_column(&frame_of(&graph, "U"), "z"), vec![15]);
    assert_eq!(report.failures().count(), 1);
    Ok(())
}

#[tokio::test]
async fn nodes_run_at_most_once() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 3]), vec![])?;
    let d = double();
    s.attach(t, d.clone())?;
    let graph = s.build_graph()?;

    let first = scheduler().run(&graph).await?;
    assert!(first.is_success());
    let second = scheduler().run(&graph).await?;
    assert!(
        second
            .outcomes()
            .all(|(_, o)| matches!(o, NodeOutcome::AlreadyDone))
    );
    assert_eq!(d.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn unchanged_inputs_are_served_from_the_cache() -> TestResult {
    let tmp = TempDir::new()?;

    let first_double = double();
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 3]), vec![])?;
    s.attach(t, first_double.clone())?;
    let first = scheduler().run(&s.build_graph()?).await?;
    assert_eq!(first.from_cache(), 0);
    assert_eq!(first_double.calls(), 1);

    let second_double = double();
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 3]), vec![])?;
    s.attach(t, second_double.clone())?;
    let graph = s.build_graph()?;
    let second = scheduler().run(&graph).await?;
    assert_eq!(second.from_cache(), 2, "load and double: {second:?}");
    assert_eq!(second_double.calls(), 0);
    assert_eq!(int_column(&frame_of(&graph, "T"), "y"), vec![2, 4, 6]);

    // Different input rows change every downstream key.
    let third_double = double();
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 4]), vec![])?;
    s.attach(t, third_double.clone())?;
    let graph = s.build_graph()?;
    let third = scheduler().run(&graph).await?;
    assert_eq!(third.from_cache(), 0);
    assert_eq!(third_double.calls(), 1);
    assert_eq!(int_column(&frame_of(&graph, "T"), "y"), vec![2, 4, 8]);
    Ok(())
}

#[tokio::test]
async fn disabling_the_cache_always_recomputes() -> TestResult {
    let tmp = TempDir::new()?;
    let config = SessionConfig {
        use_cache: false,
        ..SessionConfig::new(ExecutionMode::Deferred).rooted_at(tmp.path())
    };
    for _ in 0..2 {
        let d = double();
        let mut s = Session::new(config.clone());
        let t = s.create_table("T", xs(&[1]), vec![])?;
        s.attach(t, d.clone())?;
        let report = scheduler().run(&s.build_graph()?).await?;
        assert_eq!(report.from_cache(), 0);
        assert_eq!(d.calls(), 1);
    }
    assert!(!tmp.path().join("cache").exists());
    Ok(())
}

#[tokio::test]
async fn prerequisites_become_upstream_nodes() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2]), vec![])?;
    let d = double();
    let quad = Arc::new(Times::named("quad", "y", "z", 2).requiring(d.clone()));
    let handle = s.attach(t, quad)?;
    let graph = s.build_graph()?;

    let quad_node = graph.resolve(&handle).unwrap();
    let double_node = graph
        .resolve(&Handle::Annotator {
            table: t,
            cache_name: "double".into(),
        })
        .unwrap();
    let load_node = graph.resolve(&Handle::Load(t)).unwrap();
    let deps = &graph.node(quad_node).unwrap().dependencies;
    assert!(deps.contains(&double_node) && deps.contains(&load_node));

    let order = graph.topological_order();
    let pos = |id| order.iter().position(|n| *n == id).unwrap();
    assert!(pos(load_node) < pos(double_node) && pos(double_node) < pos(quad_node));

    scheduler().run_targets(&graph, &[handle]).await?;
    assert_eq!(int_column(&frame_of(&graph, "T"), "z"), vec![4, 8]);
    Ok(())
}

#[tokio::test]
async fn annotators_added_after_filtering_are_forwarded() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2, 3, 4]), vec![])?;
    let child = s.filter(
        t,
        "evens",
        RowFilter::function("x-is-even", evens),
        FilterOptions::default(),
    )?;
    let d = double();
    s.attach(t, d.clone())?;
    assert!(s.table(child)?.has_annotator("double"));

    let graph = s.build_graph()?;
    let report = scheduler()
        .run_targets(&graph, &[Handle::Annotate(child)])
        .await?;
    assert!(report.is_success());
    assert_eq!(int_column(&frame_of(&graph, "evens"), "y"), vec![4, 8]);
    assert_eq!(d.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn same_output_path_needs_the_same_writer() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2]), vec![])?;
    let mangler: Mangler =
        Arc::new(|frame: Frame| -> Result<Frame, ComputeError> { Ok(frame.without_column("x")) });
    let options = WriteOptions {
        mangler: Some(mangler.clone()),
        float_format: None,
    };
    let first = s.write(t, Some("out.tsv".into()), options.clone())?;
    let again = s.write(t, Some("out.tsv".into()), options)?;
    assert_eq!(first, again);

    let other: Mangler = Arc::new(|frame: Frame| -> Result<Frame, ComputeError> { Ok(frame) });
    let err = s
        .write(
            t,
            Some("out.tsv".into()),
            WriteOptions {
                mangler: Some(other),
                float_format: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictingOutput { .. }));

    let graph = s.build_graph()?;
    let files = graph
        .nodes()
        .filter(|n| matches!(n.kind, NodeKind::File { .. }))
        .count();
    assert_eq!(files, 1);
    Ok(())
}

#[tokio::test]
async fn unknown_dependencies_fail_the_build() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    s.create_table(
        "T",
        xs(&[1]),
        vec![Handle::File(tmp.path().join("never-declared.txt"))],
    )?;
    let err = s.build_graph().unwrap_err();
    assert!(matches!(err, EngineError::UnknownReference { .. }));
    Ok(())
}

#[tokio::test]
async fn generated_files_can_feed_table_loads() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let seed = s.create_table("seed", xs(&[7]), vec![])?;
    let input = tmp.path().join("input.txt");
    let target = input.clone();
    let generated = s.generate_file(
        seed,
        input.clone(),
        Arc::new(|path: &Path| -> Result<(), ComputeError> {
            std::fs::write(path, "3\n4\n")?;
            Ok(())
        }),
        vec![],
        false,
    )?;
    assert_eq!(generated.path, input);
    let loaded = s.create_table(
        "from_file",
        annoframe_core::LoadSource::function("input.txt", move || {
            let text = std::fs::read_to_string(&target)?;
            let values = text
                .lines()
                .map(str::parse::<i64>)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(common::xs(&values))
        }),
        vec![generated.handle.clone()],
    )?;
    s.attach(loaded, double())?;

    let graph = s.build_graph()?;
    let report = scheduler().run_targets(&graph, &[Handle::Annotate(loaded)]).await?;
    assert!(report.is_success(), "{report:?}");
    let frame = frame_of(&graph, "from_file");
    assert_eq!(column_names(&frame), vec!["x", "y"]);
    assert_eq!(int_column(&frame, "y"), vec![6, 8]);
    Ok(())
}

#[tokio::test]
async fn qc_entries_are_collected_while_building() -> TestResult {
    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1, 2]), vec![])?;
    s.filter(
        t,
        "evens",
        RowFilter::function("x-is-even", evens),
        FilterOptions::default(),
    )?;
    s.attach(t, double())?;
    assert!(s.qc_entries().is_empty());
    let graph = s.build_graph()?;
    let tables: Vec<&str> = graph.qc_entries().iter().map(|e| e.table.as_str()).collect();
    assert_eq!(tables, vec!["T", "evens"]);
    Ok(())
}

#[tokio::test]
async fn panicking_annotators_fail_their_node() -> TestResult {
    #[derive(Debug)]
    struct Panics(Vec<String>);

    impl annoframe_core::Annotator for Panics {
        fn columns(&self) -> &[String] {
            &self.0
        }

        fn compute(
            &self,
            _table: &annoframe_core::TableView<'_>,
        ) -> Result<annoframe_core::Computed, annoframe_core::ComputeError> {
            panic!("annotator bug")
        }
    }

    let tmp = TempDir::new()?;
    let mut s = session(ExecutionMode::Deferred, &tmp);
    let t = s.create_table("T", xs(&[1]), vec![])?;
    let handle = s.attach(t, Arc::new(Panics(vec!["p".into()])))?;
    let graph = s.build_graph()?;
    let report = scheduler().run(&graph).await?;
    let node = graph.resolve(&handle).unwrap();
    match report.outcome(node) {
        Some(NodeOutcome::Failed(err)) => {
            assert_eq!(err.kind(), ErrorKind::Computation);
            assert!(err.to_string().contains("annotator bug"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(graph.state(node), Some(NodeState::Failed(_))));
    Ok(())
}
