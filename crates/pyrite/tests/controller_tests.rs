use pretty_assertions::assert_eq;
use pyrite::{ExcType, NotAwaitingInput, Runner, SessionController, SessionStatus};

const GREETER: &str = "name = input('who? ')\nprint('hello', name)\n";

#[test]
fn script_runs_to_completion() {
    let mut session = SessionController::new();
    let result = session.start("print(40 + 2)\n");
    assert!(matches!(result.status, SessionStatus::Finished));
    assert_eq!(result.output, "42\n");
    assert!(result.execution_time_ms.is_some());
    assert!(!session.is_awaiting_input());
}

#[test]
fn input_pauses_then_resumes() {
    let mut session = SessionController::new();

    let result = session.start(GREETER);
    assert!(matches!(result.status, SessionStatus::AwaitingInput));
    assert_eq!(result.output, "who? ");
    assert_eq!(result.execution_time_ms, None);
    assert!(session.is_awaiting_input());

    let result = session.provide_input("world").unwrap();
    assert!(matches!(result.status, SessionStatus::Finished));
    assert_eq!(result.output, "hello world\n");
    assert!(result.execution_time_ms.is_some());
    assert!(!session.is_awaiting_input());
}

#[test]
fn multiple_inputs_in_one_session() {
    let source = "\
a = input()
b = input()
print(int(a) + int(b))
";
    let mut session = SessionController::new();
    assert!(matches!(session.start(source).status, SessionStatus::AwaitingInput));
    assert!(matches!(
        session.provide_input("2").unwrap().status,
        SessionStatus::AwaitingInput
    ));

    let result = session.provide_input("40").unwrap();
    assert!(matches!(result.status, SessionStatus::Finished));
    assert_eq!(result.output, "42\n");
}

#[test]
fn provide_input_without_a_waiting_script_fails() {
    let mut session = SessionController::new();
    assert_eq!(session.provide_input("anything").unwrap_err(), NotAwaitingInput);

    session.start("print('done')\n");
    assert_eq!(session.provide_input("anything").unwrap_err(), NotAwaitingInput);
}

#[test]
fn cancel_discards_the_waiting_script() {
    let mut session = SessionController::new();
    session.start(GREETER);
    assert!(session.is_awaiting_input());

    session.cancel();
    assert!(!session.is_awaiting_input());
    assert_eq!(session.provide_input("world").unwrap_err(), NotAwaitingInput);

    // cancelling again is a no-op
    session.cancel();
}

#[test]
fn starting_a_new_script_discards_the_old_session() {
    let mut session = SessionController::new();
    session.start(GREETER);
    assert!(session.is_awaiting_input());

    let result = session.start("print('fresh')\n");
    assert!(matches!(result.status, SessionStatus::Finished));
    assert_eq!(result.output, "fresh\n");
    assert_eq!(session.provide_input("world").unwrap_err(), NotAwaitingInput);
}

#[test]
fn compile_errors_report_without_running() {
    let mut session = SessionController::new();
    let result = session.start("def broken(:\n");
    let SessionStatus::Errored(exc) = result.status else {
        panic!("expected a compile failure");
    };
    assert_eq!(exc.exc, ExcType::SyntaxError);
    assert!(result.output.starts_with("SyntaxError:"), "output: {}", result.output);
    assert_eq!(result.execution_time_ms, None);
    assert!(!session.is_awaiting_input());
}

#[test]
fn runtime_errors_keep_prior_output() {
    let mut session = SessionController::new();
    let result = session.start("print('before')\nx = 1 // 0\n");
    let SessionStatus::Errored(exc) = result.status else {
        panic!("expected a runtime failure");
    };
    assert_eq!(exc.exc, ExcType::ZeroDivisionError);
    assert_eq!(
        result.output,
        "before\nZeroDivisionError: integer division or modulo by zero (line 2, column 5)\n"
    );
    assert!(result.execution_time_ms.is_some());
}

#[test]
fn runtime_error_after_resume_ends_the_session() {
    let mut session = SessionController::new();
    session.start("n = input('n? ')\nprint(1 // int(n))\n");

    let result = session.provide_input("0").unwrap();
    let SessionStatus::Errored(exc) = result.status else {
        panic!("expected a runtime failure");
    };
    assert_eq!(exc.exc, ExcType::ZeroDivisionError);
    assert!(result.execution_time_ms.is_some());
    assert!(!session.is_awaiting_input());
}

#[test]
fn frame_depth_limit_is_configurable() {
    let source = "\
def f(n):
    if n == 0:
        return 0
    return f(n - 1)
print(f(100))
";
    let mut session = SessionController::with_max_frame_depth(20);
    let result = session.start(source);
    let SessionStatus::Errored(exc) = result.status else {
        panic!("expected the depth guard to trip");
    };
    assert_eq!(exc.exc, ExcType::RecursionError);
}

#[test]
fn start_program_runs_precompiled_bytecode() {
    let program = Runner::new("print('precompiled')\n").unwrap().program().clone();
    let mut session = SessionController::new();
    let result = session.start_program(program);
    assert!(matches!(result.status, SessionStatus::Finished));
    assert_eq!(result.output, "precompiled\n");
}

#[test]
fn same_source_is_deterministic() {
    let source = "\
d = {}
for i in range(5):
    d[str(i)] = i * i
print(d)
print(d.keys())
";
    let mut session = SessionController::new();
    let first = session.start(source);
    let second = session.start(source);
    assert!(matches!(first.status, SessionStatus::Finished));
    assert!(matches!(second.status, SessionStatus::Finished));
    assert_eq!(first.output, second.output);
}
