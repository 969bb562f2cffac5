use pretty_assertions::assert_eq;
use pyrite::{CollectStringPrint, ExcType, Exception, Program, RunProgress, Runner, Snapshot};

fn run_ok(source: &str) -> String {
    let mut print = CollectStringPrint::new();
    let progress = Runner::new(source).unwrap().start(&mut print).unwrap();
    assert!(matches!(progress, RunProgress::Complete), "script did not complete");
    print.into_output()
}

fn run_err(source: &str) -> Exception {
    let mut print = CollectStringPrint::new();
    match Runner::new(source) {
        Ok(runner) => runner.start(&mut print).unwrap_err(),
        Err(e) => e,
    }
}

#[test]
fn hello_world() {
    assert_eq!(run_ok("print('hello', 'world')\n"), "hello world\n");
}

#[test]
fn integer_arithmetic() {
    assert_eq!(run_ok("print(7 // 2, 7 % 3, -7 // 2, 2 * 3 + 1)\n"), "3 1 -4 7\n");
}

#[test]
fn division_floors_toward_negative_infinity() {
    assert_eq!(run_ok("print(-7 % 3, 7 % -3)\n"), "2 -2\n");
}

#[test]
fn plain_slash_is_floor_division() {
    assert_eq!(run_ok("print(7 / 2)\n"), "3\n");
}

#[test]
fn recursive_fibonacci() {
    let source = "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)
print(fib(10))
";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn while_with_break_and_continue() {
    let source = "\
i = 0
total = 0
while True:
    i = i + 1
    if i > 10:
        break
    if i % 2 == 0:
        continue
    total = total + i
print(total)
";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn for_over_range() {
    let source = "\
items = []
for i in range(5):
    items.append(i * i)
print(items)
print(len(items))
";
    assert_eq!(run_ok(source), "[0, 1, 4, 9, 16]\n5\n");
}

#[test]
fn for_over_string_and_negative_step_range() {
    let source = "\
for c in 'ab':
    print(c)
for i in range(3, 0, -1):
    print(i)
";
    assert_eq!(run_ok(source), "a\nb\n3\n2\n1\n");
}

#[test]
fn break_inside_for_pops_iterator() {
    let source = "\
for i in range(10):
    if i == 2:
        break
    print(i)
print('after')
";
    assert_eq!(run_ok(source), "0\n1\nafter\n");
}

#[test]
fn closures_share_a_cell() {
    let source = "\
def make_counter():
    state = [0]
    def bump():
        state[0] = state[0] + 1
        return state[0]
    return bump
c = make_counter()
print(c())
print(c())
";
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn lambda_is_callable() {
    let source = "\
double = lambda x: x * 2
print(double(21))
";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn classes_with_init_and_methods() {
    let source = "\
class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y
    def dist2(self):
        return self.x * self.x + self.y * self.y
p = Point(3, 4)
print(p.x, p.y, p.dist2())
";
    assert_eq!(run_ok(source), "3 4 25\n");
}

#[test]
fn class_without_init_takes_no_arguments() {
    let source = "\
class Box:
    def put(self, v):
        self.value = v
b = Box()
b.put(7)
print(b.value)
";
    assert_eq!(run_ok(source), "7\n");
}

#[test]
fn dict_operations() {
    let source = "\
d = {'a': 1, 'b': 2}
d['c'] = 3
print(d['a'] + d['c'])
print(d.get('missing', 0))
for k in d:
    print(k)
print(len(d))
";
    assert_eq!(run_ok(source), "4\n0\na\nb\nc\n3\n");
}

#[test]
fn string_methods() {
    let source = "\
s = 'Hello World'
print(s.upper())
print(s.find('World'))
print('-'.join(['a', 'b', 'c']))
print('a,b,,c'.split(','))
print(s[0], s[-1])
";
    assert_eq!(run_ok(source), "HELLO WORLD\n6\na-b-c\n['a', 'b', '', 'c']\nH d\n");
}

#[test]
fn list_methods_and_negative_indexing() {
    let source = "\
nums = [3, 1, 2]
nums.sort()
print(nums, nums[-1])
nums.reverse()
print(nums.pop())
print(nums)
";
    assert_eq!(run_ok(source), "[1, 2, 3] 3\n1\n[3, 2]\n");
}

#[test]
fn augmented_assignment() {
    let source = "\
x = 10
x += 5
x //= 2
print(x)
vals = [1, 2]
vals[1] += 10
print(vals)
";
    assert_eq!(run_ok(source), "7\n[1, 12]\n");
}

#[test]
fn conditional_expression_and_short_circuit() {
    let source = "\
x = 5
print('big' if x > 3 else 'small')
print(x > 3 and x < 10)
print(0 or 'fallback')
";
    assert_eq!(run_ok(source), "big\nTrue\nfallback\n");
}

#[test]
fn chained_comparisons() {
    assert_eq!(run_ok("print(1 < 2 < 3, 3 > 2 > 5)\n"), "True False\n");
}

#[test]
fn equality_is_numeric_across_bool_and_int() {
    assert_eq!(run_ok("print(1 == True, 0 == False, 'a' != 'b')\n"), "True True True\n");
}

#[test]
fn builtin_conversions() {
    let source = "\
print(int('42') + 1)
print(str(42) + '!')
print(bool([]), bool([0]))
";
    assert_eq!(run_ok(source), "43\n42!\nFalse True\n");
}

#[test]
fn assigning_over_a_builtin_shadows_it() {
    let source = "\
input = 'shadowed'
print(input)
";
    assert_eq!(run_ok(source), "shadowed\n");
}

#[test]
fn zero_division_error_has_span() {
    let err = run_err("x = 1\ny = x // 0\n");
    assert_eq!(err.exc, ExcType::ZeroDivisionError);
    assert_eq!(
        err.to_string(),
        "ZeroDivisionError: integer division or modulo by zero (line 2, column 5)"
    );
}

#[test]
fn undefined_name_errors() {
    let err = run_err("print(missing)\n");
    assert_eq!(err.exc, ExcType::NameError);
    assert_eq!(err.message, "name 'missing' is not defined");
}

#[test]
fn local_read_before_assignment_errors() {
    let source = "\
def f():
    print(x)
    x = 1
f()
";
    let err = run_err(source);
    assert_eq!(err.exc, ExcType::NameError);
    assert_eq!(err.message, "name 'x' is not defined");
}

#[test]
fn mixed_operand_types_raise() {
    let err = run_err("x = 1 + 'a'\n");
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "unsupported operand type(s) for +: 'int' and 'str'");
}

#[test]
fn wrong_arity_reports_counts() {
    let source = "\
def f(a, b):
    return a
f(1)
";
    let err = run_err(source);
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "f() takes 2 positional arguments but 1 were given");
}

#[test]
fn builtin_arity_errors_name_the_builtin() {
    let err = run_err("len(1, 2)\n");
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "len() takes exactly one argument (2 given)");

    let err = run_err("bool(1, 2)\n");
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "bool() takes at most 1 argument (2 given)");

    let err = run_err("range()\n");
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "range expected at least 1 argument, got 0");
}

#[test]
fn unbounded_recursion_is_caught() {
    let source = "\
def f():
    return f()
f()
";
    let err = run_err(source);
    assert_eq!(err.exc, ExcType::RecursionError);
}

#[test]
fn missing_list_index_errors() {
    let err = run_err("x = [1, 2][5]\n");
    assert_eq!(err.exc, ExcType::IndexError);
    assert_eq!(err.message, "list index out of range");
}

#[test]
fn missing_dict_key_shows_repr() {
    let err = run_err("x = {'a': 1}['b']\n");
    assert_eq!(err.exc, ExcType::KeyError);
    assert_eq!(err.message, "'b'");
}

#[test]
fn input_suspends_and_resumes() {
    let mut print = CollectStringPrint::new();
    let progress = Runner::new("name = input('who? ')\nprint('hello', name)\n")
        .unwrap()
        .start(&mut print)
        .unwrap();
    let RunProgress::InputRequest(snapshot) = progress else {
        panic!("expected suspension at input()");
    };
    assert_eq!(print.output(), "who? ");

    let mut print = CollectStringPrint::new();
    let progress = snapshot.run("world", &mut print).unwrap();
    assert!(matches!(progress, RunProgress::Complete));
    assert_eq!(print.into_output(), "hello world\n");
}

#[test]
fn snapshot_survives_serialization() {
    let source = "\
a = input()
b = input()
print(int(a) + int(b))
";
    let mut print = CollectStringPrint::new();
    let RunProgress::InputRequest(snapshot) = Runner::new(source).unwrap().start(&mut print).unwrap() else {
        panic!("expected suspension");
    };

    let bytes = snapshot.dump().unwrap();
    let snapshot = Snapshot::load(&bytes).unwrap();

    let mut print = CollectStringPrint::new();
    let RunProgress::InputRequest(snapshot) = snapshot.run("2", &mut print).unwrap() else {
        panic!("expected a second suspension");
    };
    let mut print = CollectStringPrint::new();
    let progress = snapshot.run("40", &mut print).unwrap();
    assert!(matches!(progress, RunProgress::Complete));
    assert_eq!(print.into_output(), "42\n");
}

#[test]
fn snapshot_load_rejects_program_payload() {
    let program = Runner::new("print(1)\n").unwrap().program().clone();
    let bytes = program.to_bytes().unwrap();
    assert!(Snapshot::load(&bytes).is_err());
}

#[test]
fn compiled_program_round_trips() {
    let runner = Runner::new("print('persisted')\n").unwrap();
    let bytes = runner.program().to_bytes().unwrap();
    let program = Program::from_bytes(&bytes).unwrap();

    let mut print = CollectStringPrint::new();
    let progress = Runner::from_program(program).start(&mut print).unwrap();
    assert!(matches!(progress, RunProgress::Complete));
    assert_eq!(print.into_output(), "persisted\n");
}

#[test]
fn program_decode_rejects_garbage() {
    assert!(Program::from_bytes(b"not a program").is_err());
    assert!(Program::from_bytes(b"").is_err());
}

#[test]
fn custom_frame_depth_limit() {
    let source = "\
def f(n):
    if n == 0:
        return 0
    return f(n - 1)
print(f(200))
";
    let mut print = CollectStringPrint::new();
    let err = Runner::new(source)
        .unwrap()
        .with_max_frame_depth(50)
        .start(&mut print)
        .unwrap_err();
    assert_eq!(err.exc, ExcType::RecursionError);

    let mut print = CollectStringPrint::new();
    let progress = Runner::new(source)
        .unwrap()
        .with_max_frame_depth(500)
        .start(&mut print)
        .unwrap();
    assert!(matches!(progress, RunProgress::Complete));
    assert_eq!(print.into_output(), "0\n");
}

#[test]
fn unsupported_syntax_is_a_compile_error() {
    for source in ["x = 1.5\n", "a, b = 1, 2\n", "import os\n", "x = 1 | 2\n"] {
        let err = Runner::new(source).unwrap_err();
        assert_eq!(err.exc, ExcType::CompileError, "source: {source}");
    }
}

#[test]
fn oversized_branch_body_is_a_compile_error() {
    // the if body compiles past the i16 jump range
    let mut source = String::from("x = 0\nif x == 0:\n");
    for _ in 0..6000 {
        source.push_str("    x = x + 1\n");
    }
    let err = run_err(&source);
    assert_eq!(err.exc, ExcType::CompileError);
    assert_eq!(err.message, "module body too large");
}

#[test]
fn oversized_function_body_is_a_compile_error() {
    let mut source = String::from("def f():\n    x = 0\n    if x == 0:\n");
    for _ in 0..9000 {
        source.push_str("        x = x + 1\n");
    }
    source.push_str("f()\n");
    let err = run_err(&source);
    assert_eq!(err.exc, ExcType::CompileError);
    assert_eq!(err.message, "function body too large");
}

#[test]
fn init_must_return_none() {
    let source = "\
class C:
    def __init__(self):
        return 1
C()
";
    let err = run_err(source);
    assert_eq!(err.exc, ExcType::TypeError);
    assert_eq!(err.message, "__init__() should return None, not 'int'");
}
