use kokoki::{init, Value};

fn eval_stack(source: &str) -> Vec<Value>
{
    let mut out = Vec::new();
    init(|ctx| {
        ctx.eval(source).expect("eval failed");
        out = ctx.stack.clone();
    });
    out
}

fn eval_top(source: &str) -> Value
{
    eval_stack(source).pop().expect("empty stack")
}

fn num(n: f64) -> Value
{
    Value::Number(n)
}

fn num_arr(ns: &[f64]) -> Value
{
    Value::array(ns.iter().map(|n| Value::Number(*n)).collect())
}

fn str_arr(ss: &[&str]) -> Value
{
    Value::array(ss.iter().map(|s| Value::string(*s)).collect())
}

fn assert_error(value: &Value, expected: &str)
{
    match value
    {
        Value::Error(msg) => assert_eq!(msg.as_str(), expected),
        other => panic!("expected error '{}', got {:?}", expected, other),
    }
}

#[test]
fn comments()
{
    let stack = eval_stack("# this is a comment\n 1 2 3 + # and so is this\n+");
    assert_eq!(stack, vec![num(6.0)]);
}

#[test]
fn block_comments()
{
    assert_eq!(eval_stack(": inc ( n -- n ) 1 + ; 41 inc"), vec![num(42.0)]);
}

#[test]
fn character_literals()
{
    assert_eq!(eval_top("'a'"), num(97.0));
}

#[test]
fn pick()
{
    assert_eq!(eval_stack("1 2 3 0 pick"), vec![num(1.0), num(2.0), num(3.0), num(3.0)]);
    assert_eq!(eval_top("1 2 3 2 pick"), num(1.0));
}

#[test]
fn pick_underflow()
{
    let stack = eval_stack("1 2 42 pick");
    assert_eq!(stack.len(), 3);
    assert_error(&stack[2], "Stack underflow! (2 < 43)");
}

#[test]
fn move_word()
{
    let stack = eval_stack("1 2 3 1 move");
    assert_eq!(stack, vec![num(1.0), num(3.0), num(2.0)]);
}

#[test]
fn move_underflow()
{
    let stack = eval_stack("1 move");
    assert_eq!(stack.len(), 1);
    assert_error(&stack[0], "Stack underflow! (0 < 2)");
}

#[test]
fn basic_shuffles()
{
    assert_eq!(eval_stack("42 dup"), vec![num(42.0), num(42.0)]);
    assert_eq!(eval_stack("1 2 3 rot"), vec![num(2.0), num(3.0), num(1.0)]);
    assert_eq!(eval_stack("1 2 3 drop"), vec![num(1.0), num(2.0)]);
    assert_eq!(eval_stack("420 69 swap"), vec![num(69.0), num(420.0)]);
    assert_eq!(eval_stack("1 2 nip"), vec![num(2.0)]);
    assert_eq!(eval_stack("1 2 over"), vec![num(1.0), num(2.0), num(1.0)]);
    assert_eq!(eval_stack("1 2 tuck"), vec![num(2.0), num(1.0), num(2.0)]);
}

#[test]
fn define_value()
{
    assert_eq!(eval_stack(": pi 3.1415 ; 2 pi *"), vec![num(6.283)]);
}

#[test]
fn define_code()
{
    assert_eq!(eval_stack(": squared dup * ; 3 squared"), vec![num(9.0)]);
}

#[test]
fn definitions_are_equivalent_to_their_bodies()
{
    assert_eq!(eval_stack(": w 1 2 + ;  w"), eval_stack("1 2 +"));
    assert_eq!(eval_stack(": sq dup * ; 9 sq"), vec![num(81.0)]);
}

#[test]
fn comparisons()
{
    assert_eq!(eval_top("7 10 <"), Value::True);
    assert_eq!(eval_top("7 10 >"), Value::False);
    assert_eq!(eval_top("10 10 <="), Value::True);
    assert_eq!(eval_top("10 11 >="), Value::False);
}

#[test]
fn integer_literals_survive_the_compact_encodings()
{
    for n in [-32768.0, -32767.0, -129.0, -128.0, -1.0, 0.0, 1.0, 127.0, 128.0, 32767.0]
    {
        assert_eq!(eval_top(&format!("{}", n)), num(n), "literal {}", n);
    }
}

#[test]
fn if_then()
{
    assert_eq!(eval_stack("1 2 < if \"small\" then"), vec![Value::string("small")]);
    assert_eq!(eval_stack("1 2 > if \"small\" then"), vec![]);
}

#[test]
fn if_then_else()
{
    assert_eq!(
        eval_stack("1 2 < if \"small\" else \"big\" then"),
        vec![Value::string("small")]
    );
    assert_eq!(
        eval_stack("10 2 < if \"small\" else \"big\" then"),
        vec![Value::string("big")]
    );
}

#[test]
fn nested_ifs()
{
    let howbig = ": howbig dup 100 > if 1000 > if \"very\" then \"big\" then ; ";
    assert_eq!(eval_stack(&format!("{} 120 howbig", howbig)), vec![Value::string("big")]);
    assert_eq!(
        eval_stack(&format!("{} 1220 howbig drop", howbig)),
        vec![Value::string("very")]
    );
}

#[test]
fn eggsize()
{
    let eggsize = ": eggsize ( n -- ) \
        dup 18 < if \"reject\"      else \
        dup 21 < if \"small\"       else \
        dup 24 < if \"medium\"      else \
        dup 27 < if \"large\"       else \
        dup 30 < if \"extra large\" else \
        \"error\" \
        then then then then then nip ; ";
    assert_eq!(eval_stack(&format!("{} 25 eggsize", eggsize)), vec![Value::string("large")]);
    assert_eq!(eval_stack(&format!("{} 17 eggsize", eggsize)), vec![Value::string("reject")]);
    assert_eq!(
        eval_stack(&format!("{} 99 eggsize", eggsize)),
        vec![Value::string("error")]
    );
}

const AGE_CHECK: &str = "[ [dup 10 <] \"child\" \
                           [dup 25 <] \"young adult\" \
                           [dup 55 <] \"adult\" \
                           true       \"older adult\"] cond";

#[test]
fn cond_walks_condition_action_pairs()
{
    let stack = eval_stack(&format!("7 {}", AGE_CHECK));
    assert_eq!(stack, vec![num(7.0), Value::string("child")]);
    assert_eq!(eval_top(&format!("22 {}", AGE_CHECK)), Value::string("young adult"));
    assert_eq!(eval_top(&format!("44 {}", AGE_CHECK)), Value::string("adult"));
    assert_eq!(eval_top(&format!("123 {}", AGE_CHECK)), Value::string("older adult"));
}

#[test]
fn cond_rejects_dangling_conditions()
{
    let stack = eval_stack("42 [true] cond");
    assert_error(
        &stack[stack.len() - 1],
        "Cond requires an array with alternating condition/action pairs.",
    );
}

#[test]
fn slurp()
{
    assert_eq!(
        eval_stack("\"tests/data/small.txt\" slurp"),
        vec![Value::string("Korvatunturin Konkatenatiivinen Kieli\n")]
    );
}

#[test]
fn slurp_missing_file_is_an_error_value()
{
    let stack = eval_stack("\"tests/data/no-such-file\" slurp");
    match &stack[0]
    {
        Value::Error(msg) => assert!(msg.starts_with("Could not read"), "{}", msg),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn lines_splits_on_newlines()
{
    assert_eq!(
        eval_stack("\"tests/data/lines.txt\" slurp lines"),
        vec![str_arr(&["first", "second", "third", "", "fourth after empty"])]
    );
}

#[test]
fn each_maps_into_a_fresh_array()
{
    assert_eq!(eval_stack("[1 2 3] [2 *] each"), vec![num_arr(&[2.0, 4.0, 6.0])]);
    assert_eq!(
        eval_stack(": inc 1 + ; [41 665] [inc] each"),
        vec![num_arr(&[42.0, 666.0])]
    );
}

#[test]
fn fold()
{
    assert_eq!(eval_stack("[1 2 3 0] [+] fold"), vec![num(6.0)]);
    assert_eq!(eval_stack("[42] [+] fold"), vec![num(42.0)]);
    assert_eq!(
        eval_stack("[\"foo\" \"bar\" \"baz\"] [cat] fold"),
        vec![Value::string("foobarbaz")]
    );
}

#[test]
fn foldi_passes_the_element_index()
{
    // acc elem i -- acc': 10+20+1 = 31, then 31+30+2 = 63.
    assert_eq!(eval_stack("[10 20 30] [+ +] foldi"), vec![num(63.0)]);
}

#[test]
fn filter_keeps_truthy_predicates()
{
    assert_eq!(
        eval_stack("[1 2 3 6 8 41] [2 % 0 =] filter"),
        vec![num_arr(&[2.0, 6.0, 8.0])]
    );
}

#[test]
fn cat()
{
    assert_eq!(eval_top("\"foo\" \"bar\" cat"), Value::string("foobar"));
    assert_eq!(eval_top("\"foo\" 33 cat"), Value::string("foo!"));
    assert_eq!(eval_top("33 \"foo\" cat"), Value::string("!foo"));
    assert_eq!(eval_top("[1 2] [3] cat"), num_arr(&[1.0, 2.0, 3.0]));
}

#[test]
fn not_negates_truthiness()
{
    assert_eq!(eval_top("1 2 < not"), Value::False);
    assert_eq!(eval_top("false not"), Value::True);
    assert_eq!(eval_top("nil not"), Value::True);
    assert_eq!(eval_top("42 not"), Value::False);
}

#[test]
fn apush_len_aget()
{
    assert_eq!(eval_stack("[ 1 2 ] 3 apush"), vec![num_arr(&[1.0, 2.0, 3.0])]);
    let stack = eval_stack("[1 2 3] len");
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[1], num(3.0));
    let stack = eval_stack("[1 2 3] 1 aget");
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[1], num(2.0));
    let stack = eval_stack("\"foo!\" 3 aget");
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[1], num(33.0));
}

#[test]
fn apush_grows_len_by_one()
{
    let stack = eval_stack("[1 2 3] len swap 4 apush len");
    // old length, array, new length
    assert_eq!(stack[0], num(3.0));
    assert_eq!(stack[2], num(4.0));
}

#[test]
fn aset_and_adel()
{
    assert_eq!(eval_stack("[1 2 3] 1 42 aset"), vec![num_arr(&[1.0, 42.0, 3.0])]);
    assert_eq!(eval_stack("[1 2] 2 3 aset"), vec![num_arr(&[1.0, 2.0, 3.0])]);
    assert_eq!(eval_stack("[1 2 3 4] 2 adel"), vec![num_arr(&[1.0, 2.0, 4.0])]);
}

#[test]
fn aget_out_of_bounds()
{
    let stack = eval_stack("[1 2] 5 aget");
    assert_eq!(stack.len(), 2);
    assert_error(&stack[1], "Index out of bounds 5 (0 - 1 inclusive)");
}

#[test]
fn apop()
{
    let stack = eval_stack("[1 2 3] apop");
    assert_eq!(stack, vec![num_arr(&[1.0, 2.0]), num(3.0)]);
}

#[test]
fn times_repeats_values_and_blocks()
{
    assert_eq!(eval_stack("3 4 times + + +"), vec![num(12.0)]);
    assert_eq!(eval_stack("[] [6 apush] 3 times"), vec![num_arr(&[6.0, 6.0, 6.0])]);
}

#[test]
fn while_loops_until_the_condition_fails()
{
    assert_eq!(eval_stack("0 [dup 5 <] [1 +] while"), vec![num(5.0)]);
}

#[test]
fn refs()
{
    assert_eq!(eval_stack("@foo ?"), vec![Value::Nil]);
    assert_eq!(eval_stack("@foo 42 !"), vec![]);
    assert_eq!(eval_stack("[] @foo 42 ! @foo ? apush"), vec![num_arr(&[42.0])]);
    assert_eq!(eval_top("@x 666 ! @x ? @x ? ="), Value::True);
}

#[test]
fn ref_update()
{
    assert_eq!(eval_stack("@x 40 ! @x [2 +] !! @x ?"), vec![num(42.0)]);
    assert_eq!(eval_stack("@x 4.2 ! @x [10 *] !?"), vec![num(42.0)]);
}

#[test]
fn eval_native()
{
    assert_eq!(eval_stack("\"4.2 10 *\" eval"), vec![num(42.0)]);
}

#[test]
fn eval_native_defines_into_the_same_context()
{
    // The definition only exists once the string has been evaluated, so
    // the word is usable from the next evaluation on.
    init(|ctx| {
        ctx.eval("\": twice 2 * ;\" eval").expect("eval of eval");
        ctx.eval("21 twice").expect("call");
        assert_eq!(ctx.stack, vec![num(42.0)]);
    });
}

#[test]
fn and_or()
{
    assert_eq!(eval_top("1 2 and"), Value::True);
    assert_eq!(eval_top("1 false and"), Value::False);
    assert_eq!(eval_top("true 42 and"), Value::True);
    assert_eq!(eval_top("nil false or"), Value::False);
    assert_eq!(eval_top("nil 1 or"), Value::True);
}

#[test]
fn reverse()
{
    assert_eq!(eval_stack("[1 2 3] reverse"), vec![num_arr(&[3.0, 2.0, 1.0])]);
    assert_eq!(eval_top("\"foobar\" reverse"), Value::string("raboof"));
}

#[test]
fn reverse_twice_is_identity()
{
    assert_eq!(
        eval_stack("[1 \"a\" true] reverse reverse"),
        vec![Value::array(vec![num(1.0), Value::string("a"), Value::True])]
    );
}

#[test]
fn sort()
{
    assert_eq!(eval_stack("[666 12 42 0] sort"), vec![num_arr(&[0.0, 12.0, 42.0, 666.0])]);
    assert_eq!(
        eval_stack("[\"foo\" \"Afoobar\"] sort"),
        vec![str_arr(&["Afoobar", "foo"])]
    );
    assert_eq!(
        eval_stack("[\"foobar\" \"foo\"] sort"),
        vec![str_arr(&["foo", "foobar"])]
    );
}

#[test]
fn compare_returns_the_sign()
{
    assert_eq!(eval_top("1 2 compare"), num(-1.0));
    assert_eq!(eval_top("2 2 compare"), num(0.0));
    assert_eq!(eval_top("3 2 compare"), num(1.0));
}

#[test]
fn slice_is_half_open_and_clamped()
{
    assert_eq!(eval_stack("[1 2 3 4] 1 3 slice"), vec![num_arr(&[2.0, 3.0])]);
    assert_eq!(eval_top("\"foobar\" 0 3 slice"), Value::string("foo"));
    assert_eq!(eval_stack("[1 2] 1 99 slice"), vec![num_arr(&[2.0])]);
}

#[test]
fn structural_equality()
{
    assert_eq!(eval_top("[1 2] [1 2] ="), Value::True);
    assert_eq!(eval_top("[1 2] [1 3] ="), Value::False);
    assert_eq!(eval_top("\"x\" \"x\" ="), Value::True);
    assert_eq!(eval_top("1 \"1\" ="), Value::False);
}

#[test]
fn copy_is_deep_and_equal()
{
    assert_eq!(eval_top("[1 [2 3]] dup copy ="), Value::True);
    // Mutating the copy leaves the original alone.
    assert_eq!(
        eval_stack("[1 2] dup copy 9 apush"),
        vec![num_arr(&[1.0, 2.0]), num_arr(&[1.0, 2.0, 9.0])]
    );
}

#[test]
fn exec_runs_blocks_and_pushes_plain_values()
{
    assert_eq!(eval_stack("[1 2 +] exec"), vec![num(3.0)]);
    assert_eq!(eval_stack("42 exec"), vec![num(42.0)]);
}

#[test]
fn shifts()
{
    assert_eq!(eval_top("1 6 <<"), num(64.0));
    assert_eq!(eval_top("64 3 >>"), num(8.0));
}

#[test]
fn modulo()
{
    assert_eq!(eval_top("42 7 %"), num(0.0));
    assert_eq!(eval_top("43 7 %"), num(1.0));
}

#[test]
fn hashmap_literals_and_natives()
{
    let stack = eval_stack("{\"foo\" 42} \"foo\" hmget");
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[1], num(42.0));

    let stack = eval_stack("{\"a\" 1, \"b\" 2} \"b\" hmget");
    assert_eq!(stack[1], num(2.0));

    let stack = eval_stack("{\"a\" 1} \"missing\" hmget");
    assert_eq!(stack[1], Value::Nil);

    let stack = eval_stack("{\"a\" 1} \"a\" hmdel \"a\" hmget");
    assert_eq!(stack[1], Value::Nil);

    let stack = eval_stack("{} \"k\" \"v\" hmput \"k\" hmget");
    assert_eq!(stack[1], Value::string("v"));
}

#[test]
fn runtime_errors_do_not_stop_execution()
{
    let stack = eval_stack("\"x\" 1 + 9");
    assert_eq!(stack.len(), 2);
    assert_error(&stack[0], "Type error: '+' expects numbers");
    assert_eq!(stack[1], num(9.0));
}

#[test]
fn a_session_spans_multiple_evaluations()
{
    init(|ctx| {
        ctx.eval(": sq dup * ;").expect("first eval");
        ctx.eval("9 sq").expect("second eval");
        assert_eq!(ctx.stack, vec![num(81.0)]);
        // A failed compile leaves everything usable.
        assert!(ctx.eval("no-such-word").is_err());
        ctx.eval("sq").expect("third eval");
        assert_eq!(ctx.stack, vec![num(6561.0)]);
    });
}

#[test]
fn blocks_nest()
{
    assert_eq!(
        eval_stack("[[1 2] [3 4]] [[2 *] each] each"),
        vec![Value::array(vec![num_arr(&[2.0, 4.0]), num_arr(&[6.0, 8.0])])]
    );
}

#[test]
fn literal_arrays_are_fresh_per_execution()
{
    assert_eq!(
        eval_stack(": box [ ] ; box 1 apush box"),
        vec![num_arr(&[1.0]), num_arr(&[])]
    );
}

#[test]
fn conditionals_inside_blocks()
{
    assert_eq!(
        eval_stack("[1 2 3] [dup 2 < if drop 0 then] each"),
        vec![num_arr(&[0.0, 2.0, 3.0])]
    );
}
