//! Black-box parsing scenarios combining several grammar features at
//! once, plus the diagnostic-reporting contract on malformed input.

use picojs_parser::{Expr, ForInit, FunctionBody, ParseError, Parser, Stmt, VarKind};

fn parse_ok(src: &str) -> picojs_parser::Program {
    let (program, errors) = Parser::parse_program(src);
    assert!(!errors.has_errors(), "unexpected parse errors for {src:?}: {:?}", errors.errors());
    program.expect("parse_program returned None without recording an error")
}

#[test]
fn a_small_program_mixing_closures_template_literals_and_for_of() {
    let src = r#"
        "use strict";
        function makeCounter(start) {
            let count = start;
            return function () {
                return count++;
            };
        }
        const names = ["a", "b", "c"];
        for (const n of names) {
            console.log(`name: ${n}, total: ${names.length}`);
        }
    "#;
    let program = parse_ok(src);
    assert!(program.strict);
    assert_eq!(program.body.len(), 3);

    match &program.body[0] {
        Stmt::FunctionDecl(f) => {
            assert_eq!(f.name.as_deref(), Some("makeCounter"));
            assert_eq!(f.params, vec!["start".to_string()]);
            match &f.body {
                FunctionBody::Parsed(stmts) => assert_eq!(stmts.len(), 2),
                FunctionBody::Lazy { .. } => panic!("eager parse should never defer"),
            }
        }
        other => panic!("expected function declaration, got {other:?}"),
    }

    match &program.body[1] {
        Stmt::VarDecl { kind: VarKind::Const, decls, .. } => {
            assert_eq!(decls.len(), 1);
            assert_eq!(decls[0].0, "names");
        }
        other => panic!("expected const declaration, got {other:?}"),
    }

    match &program.body[2] {
        Stmt::ForOf { left, right, .. } => {
            match left.as_ref() {
                ForInit::VarDecl { kind: VarKind::Const, decls } => assert_eq!(decls[0].0, "n"),
                other => panic!("expected const binding in for-of head, got {other:?}"),
            }
            assert!(matches!(right, Expr::Identifier { name, .. } if name == "names"));
        }
        other => panic!("expected for-of statement, got {other:?}"),
    }
}

#[test]
fn arrow_functions_and_default_style_conditional_chains_nest_correctly() {
    let src = "const clamp = (x, lo, hi) => x < lo ? lo : x > hi ? hi : x;";
    let program = parse_ok(src);
    let decls = match &program.body[0] {
        Stmt::VarDecl { decls, .. } => decls,
        other => panic!("expected var declaration, got {other:?}"),
    };
    let init = decls[0].1.as_ref().expect("clamp initializer");
    match init {
        Expr::ArrowFunctionExpr(f) => {
            assert_eq!(f.params, vec!["x".to_string(), "lo".to_string(), "hi".to_string()]);
            match &f.body {
                FunctionBody::Parsed(stmts) => match &stmts[0] {
                    Stmt::Return { argument: Some(Expr::Conditional { .. }), .. } => {}
                    other => panic!("expected a conditional return, got {other:?}"),
                },
                FunctionBody::Lazy { .. } => panic!("arrow bodies are never deferred"),
            }
        }
        other => panic!("expected arrow function, got {other:?}"),
    }
}

#[test]
fn a_parenthesized_sequence_is_not_mistaken_for_arrow_params() {
    let src = "var x = (a, b);";
    let program = parse_ok(src);
    match &program.body[0] {
        Stmt::VarDecl { decls, .. } => match decls[0].1.as_ref().unwrap() {
            Expr::Sequence { expressions, .. } => assert_eq!(expressions.len(), 2),
            other => panic!("expected sequence expression, got {other:?}"),
        },
        other => panic!("expected var declaration, got {other:?}"),
    }
}

#[test]
fn unexpected_token_is_reported_without_panicking_and_without_a_cascade() {
    let (program, errors) = Parser::parse_program("var x = ;");
    assert!(program.is_none());
    assert!(errors.has_errors());
    assert_eq!(errors.errors().len(), 1, "parser must stop after the first diagnostic");
    assert!(matches!(errors.first(), Some(ParseError::UnexpectedToken { .. })));
}

#[test]
fn unterminated_string_is_reported_with_its_start_offset() {
    let src = "var x = 'unterminated";
    let (program, errors) = Parser::parse_program(src);
    assert!(program.is_none());
    match errors.first() {
        Some(ParseError::UnterminatedString { offset }) => assert_eq!(*offset, 8),
        other => panic!("expected UnterminatedString, got {other:?}"),
    }
}

#[test]
fn try_catch_with_nested_function_and_switch_like_if_chain_parses() {
    let src = r#"
        function classify(n) {
            try {
                if (n < 0) {
                    throw new Error("negative");
                } else if (n === 0) {
                    return "zero";
                } else {
                    return "positive";
                }
            } catch (e) {
                return "error: " + e;
            } finally {
                n = 0;
            }
        }
    "#;
    let program = parse_ok(src);
    match &program.body[0] {
        Stmt::FunctionDecl(f) => match &f.body {
            FunctionBody::Parsed(stmts) => match &stmts[0] {
                Stmt::Try { handler, finalizer, .. } => {
                    assert!(handler.is_some());
                    assert!(finalizer.is_some());
                }
                other => panic!("expected try statement, got {other:?}"),
            },
            FunctionBody::Lazy { .. } => panic!("eager parse should never defer"),
        },
        other => panic!("expected function declaration, got {other:?}"),
    }
}

#[test]
fn pre_parse_defers_a_long_function_body_but_every_short_one_stays_eager() {
    let short = "function tiny() { return 1; }";
    let long_body = format!(
        "function big() {{ {} return 0; }}",
        "var a = 1; var b = 2; var c = 3; var d = 4; var e = 5; var f = 6; var g = 7; ".repeat(3)
    );
    let src = format!("{short}\n{long_body}");
    let (program, pre_result, errors) = Parser::pre_parse(&src);
    assert!(!errors.has_errors());
    let program = program.unwrap();

    match &program.body[0] {
        Stmt::FunctionDecl(f) => assert!(matches!(f.body, FunctionBody::Parsed(_)), "tiny() should not be deferred"),
        other => panic!("expected function declaration, got {other:?}"),
    }
    match &program.body[1] {
        Stmt::FunctionDecl(f) => assert!(matches!(f.body, FunctionBody::Lazy { .. }), "big() should be deferred"),
        other => panic!("expected function declaration, got {other:?}"),
    }
    assert_eq!(pre_result.function_ranges.len(), 1);
    assert_eq!(pre_result.function_ranges[0].name.as_deref(), Some("big"));
}
