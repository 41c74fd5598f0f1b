use itertools::Itertools;
use stackwalk::{capture, CaptureMethod, CaptureOptions, StopReason, Target};

mod common;

use common::{capture_all_local, common_prefix_len, init_logging, position_of, recurse};

const DEPTH: usize = 5;

fn options() -> CaptureOptions {
    CaptureOptions::new().max_depth(256)
}

#[test]
fn methods_agree_down_to_the_test_function() {
    init_logging();
    let options = options();
    let traces = recurse(DEPTH, &mut || capture_all_local(&options));
    assert_eq!(traces.len(), 4);

    let mut outermost = 0;
    for trace in &traces {
        let position = position_of(trace, "methods_agree_down_to_the_test_function")
            .unwrap_or_else(|| panic!("test function missing from\n{trace}"));
        outermost = outermost.max(position);
    }
    let shared = common_prefix_len(&traces);
    assert!(
        shared > outermost,
        "traces diverge at frame {shared}:\n{}",
        traces.iter().map(|t| format!("{}:\n{t}", t.method())).join("\n")
    );

    // The frame pointer walk may end early in code built without frame pointers; the
    // CFI-based methods all reach the thread's entry point.
    assert!(
        traces
            .iter()
            .filter(|t| t.method() != CaptureMethod::FramePointer)
            .map(|t| t.len())
            .all_equal(),
        "frame counts differ:\n{}",
        traces.iter().map(|t| format!("{}:\n{t}", t.method())).join("\n")
    );
}

#[test]
fn one_more_level_adds_one_frame() {
    init_logging();
    let options = options();
    let shallow = recurse(DEPTH, &mut || capture_all_local(&options));
    let deep = recurse(DEPTH + 1, &mut || capture_all_local(&options));
    for (shallow, deep) in shallow.iter().zip_eq(&deep) {
        assert_ne!(shallow.stop_reason(), StopReason::DepthLimit, "{shallow}");
        assert_eq!(shallow.stop_reason(), deep.stop_reason());
        assert_eq!(
            deep.len(),
            shallow.len() + 1,
            "{}:\n{shallow}\n{deep}",
            shallow.method()
        );
    }
}

#[test]
fn traces_saturate_at_max_depth() {
    init_logging();
    let options = CaptureOptions::new().max_depth(3);
    let traces = recurse(DEPTH, &mut || capture_all_local(&options));
    for trace in &traces {
        assert_eq!(trace.len(), 3, "{}", trace.method());
        assert_eq!(trace.stop_reason(), StopReason::DepthLimit);
    }

    let options = CaptureOptions::new().max_depth(0);
    for trace in capture_all_local(&options) {
        assert!(trace.is_empty());
        assert_eq!(trace.stop_reason(), StopReason::DepthLimit);
    }
}

#[test]
fn repeated_captures_are_identical_in_length() {
    init_logging();
    let options = options();
    let (first, second) = recurse(DEPTH, &mut || {
        (capture_all_local(&options), capture_all_local(&options))
    });
    for (first, second) in first.iter().zip_eq(&second) {
        assert_eq!(first.method(), second.method());
        assert_eq!(first.len(), second.len(), "{first}\n{second}");
        assert_eq!(first.stop_reason(), second.stop_reason());
    }
}

#[test]
fn frames_are_symbolicated() {
    init_logging();
    let options = options();
    let trace = recurse(2, &mut || {
        capture(CaptureMethod::DebugInfo, Target::SelfProcess, &options).unwrap()
    });
    assert_eq!(trace.method(), CaptureMethod::DebugInfo);
    assert_eq!(trace.target(), Target::SelfProcess);

    let first = trace.frames()[0].symbol().expect("first frame has a symbol");
    assert!(first.name.ends_with("::capture"), "{trace}");
    let recursion = trace
        .frames()
        .iter()
        .filter(|f| f.symbol().is_some_and(|s| s.name.contains("common::recurse")))
        .count();
    assert_eq!(recursion, 3, "{trace}");
    let exe = std::env::current_exe().unwrap();
    let exe_name = exe.file_name().unwrap().to_str().unwrap();
    assert!(trace.frames()[0]
        .module()
        .is_some_and(|m| m.path.ends_with(exe_name)));

    let bare = capture(
        CaptureMethod::DebugInfo,
        Target::SelfProcess,
        &options.clone().symbolicate(false),
    )
    .unwrap();
    assert!(bare.frames().iter().all(|f| f.symbol().is_none()));
    assert_eq!(bare.frames()[0].render(), "<unknown>");
}

#[test]
fn local_methods_reject_other_processes() {
    let err = capture(
        CaptureMethod::FramePointer,
        Target::Process(1),
        &CaptureOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        stackwalk::CaptureError::UnsupportedTarget {
            method: CaptureMethod::FramePointer,
            target: Target::Process(1),
        }
    ));
}
