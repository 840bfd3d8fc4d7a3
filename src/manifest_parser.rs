// Copyright 2011 Google Inc. All Rights Reserved.
// Copyright 2018 The Majak Project Developers. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::RefCell;
use std::rc::Rc;

use crate::disk_interface::FileReader;
use crate::eval_env::{BindingEnv, EvalString, Rule};
use crate::lexer::{Lexer, LexerToken};
use crate::state::{Pool, State};
use crate::utils::canonicalize_path;
use crate::version::check_version;

#[derive(Clone, Copy, PartialEq)]
pub enum DupeEdgeAction {
    Warn,
    Error,
}

#[derive(Clone, Copy, PartialEq)]
pub enum PhonyCycleAction {
    Warn,
    Error,
}

#[derive(Clone)]
pub struct ManifestParserOptions {
    pub dupe_edge_action: DupeEdgeAction,
    pub phony_cycle_action: PhonyCycleAction,
}

impl Default for ManifestParserOptions {
    fn default() -> Self {
        ManifestParserOptions {
            dupe_edge_action: DupeEdgeAction::Warn,
            phony_cycle_action: PhonyCycleAction::Warn,
        }
    }
}

/// Parses .ninja files.
pub struct ManifestParser<'a> {
    state: &'a mut State,
    env: Rc<RefCell<BindingEnv>>,
    file_reader: &'a dyn FileReader,
    options: ManifestParserOptions,
    quiet: bool,
}

impl<'a> ManifestParser<'a> {
    pub fn new(
        state: &'a mut State,
        file_reader: &'a dyn FileReader,
        options: ManifestParserOptions,
    ) -> Self {
        let env = state.get_env();
        Self::new_with_env(state, file_reader, options, env)
    }

    fn new_with_env(
        state: &'a mut State,
        file_reader: &'a dyn FileReader,
        options: ManifestParserOptions,
        env: Rc<RefCell<BindingEnv>>,
    ) -> Self {
        ManifestParser {
            state,
            env,
            file_reader,
            options,
            quiet: false,
        }
    }

    /// Load and parse a file.
    pub fn load(&mut self, filename: &str) -> Result<(), String> {
        self.load_with_parent(filename, None)
    }

    fn load_with_parent(&mut self, filename: &str, parent: Option<&Lexer>) -> Result<(), String> {
        let mut contents = Vec::new();
        if let Err(read_err) = self.file_reader.read_file(filename, &mut contents) {
            let err = format!("loading '{}': {}", filename, read_err.message());
            return Err(match parent {
                Some(lexer) => lexer.error(&err),
                None => err,
            });
        }

        let contents = String::from_utf8(contents)
            .map_err(|_| format!("loading '{}': invalid utf-8", filename))?;
        self.parse(filename, &contents)
    }

    /// Parse a text string of input.  Used by tests.
    #[cfg(test)]
    pub(crate) fn parse_test(&mut self, input: &str) -> Result<(), String> {
        self.quiet = true;
        self.parse("input", input)
    }

    /// Parse a file, given its contents as a string.
    fn parse(&mut self, filename: &str, input: &str) -> Result<(), String> {
        let mut lexer = Lexer::new(filename, input);
        loop {
            let token = lexer.read_token();
            match token {
                LexerToken::Pool => self.parse_pool(&mut lexer)?,
                LexerToken::Build => self.parse_edge(&mut lexer)?,
                LexerToken::Rule => self.parse_rule(&mut lexer)?,
                LexerToken::Default => self.parse_default(&mut lexer)?,
                LexerToken::Ident => {
                    lexer.unread_token();
                    let (name, let_value) = self.parse_let(&mut lexer)?;
                    let value = let_value.evaluate(&*self.env.borrow());
                    // Check ninja_required_version immediately so we can
                    // exit before encountering any syntactic surprises.
                    if name == "ninja_required_version" {
                        check_version(&value);
                    }
                    self.env.borrow_mut().add_binding(&name, &value);
                }
                LexerToken::Include => self.parse_file_include(&mut lexer, false)?,
                LexerToken::Subninja => self.parse_file_include(&mut lexer, true)?,
                LexerToken::Error => {
                    return Err(lexer.error(lexer.describe_last_error()));
                }
                LexerToken::Teof => return Ok(()),
                LexerToken::Newline => {}
                _ => {
                    return Err(lexer.error(&format!("unexpected {}", token.name())));
                }
            }
        }
    }

    fn parse_pool(&mut self, lexer: &mut Lexer) -> Result<(), String> {
        let name = lexer.read_ident("expected pool name")?.to_owned();
        self.expect_token(lexer, LexerToken::Newline)?;

        if self.state.pool_state.lookup_pool(&name).is_some() {
            return Err(lexer.error(&format!("duplicate pool '{}'", name)));
        }

        let mut depth = None;
        while lexer.peek_token(LexerToken::Indent) {
            let (key, value) = self.parse_let(lexer)?;
            if key != "depth" {
                return Err(lexer.error(&format!("unexpected variable '{}'", key)));
            }

            let depth_string = value.evaluate(&*self.env.borrow());
            depth = match depth_string.parse::<isize>() {
                Ok(value) if value >= 0 => Some(value),
                _ => return Err(lexer.error("invalid pool depth")),
            };
        }

        let depth = depth.ok_or_else(|| lexer.error("expected 'depth =' line"))?;
        self.state.pool_state.add_pool(Pool::new(&name, depth));
        Ok(())
    }

    fn parse_rule(&mut self, lexer: &mut Lexer) -> Result<(), String> {
        let name = lexer.read_ident("expected rule name")?.to_owned();
        self.expect_token(lexer, LexerToken::Newline)?;

        if self.env.borrow().lookup_rule_current_scope(&name).is_some() {
            return Err(lexer.error(&format!("duplicate rule '{}'", name)));
        }

        let mut rule = Rule::new(name);
        while lexer.peek_token(LexerToken::Indent) {
            let (key, value) = self.parse_let(lexer)?;
            if Rule::is_reserved_binding(&key) {
                rule.add_binding(&key, &value);
            } else {
                // Die on other keyvals for now; revisit if we want to add
                // a scope here.
                return Err(lexer.error(&format!("unexpected variable '{}'", key)));
            }
        }

        if rule.get_binding("rspfile").is_none() != rule.get_binding("rspfile_content").is_none() {
            return Err(lexer.error("rspfile and rspfile_content need to be both specified"));
        }

        if rule.get_binding("command").is_none() {
            return Err(lexer.error("expected 'command =' line"));
        }

        self.env.borrow_mut().add_rule(Rc::new(rule));
        Ok(())
    }

    fn parse_let(&mut self, lexer: &mut Lexer) -> Result<(String, EvalString), String> {
        let key = lexer.read_ident("expected variable name")?.to_owned();
        self.expect_token(lexer, LexerToken::Equals)?;
        let mut value = EvalString::new();
        lexer.read_var_value(&mut value)?;
        Ok((key, value))
    }

    fn parse_edge(&mut self, lexer: &mut Lexer) -> Result<(), String> {
        let mut outs = Vec::new();
        loop {
            let mut out = EvalString::new();
            lexer.read_path(&mut out)?;
            if out.is_empty() {
                break;
            }
            outs.push(out);
        }

        // Add all implicit outs, counting how many as we go.
        let mut implicit_outs = 0usize;
        if lexer.peek_token(LexerToken::Pipe) {
            loop {
                let mut out = EvalString::new();
                lexer.read_path(&mut out)?;
                if out.is_empty() {
                    break;
                }
                outs.push(out);
                implicit_outs += 1;
            }
        }

        if outs.is_empty() {
            return Err(lexer.error("expected path"));
        }

        self.expect_token(lexer, LexerToken::Colon)?;

        let rule = {
            let rule_name = lexer.read_ident("expected build command name")?;
            self.env
                .borrow()
                .lookup_rule(rule_name)
                .ok_or_else(|| lexer.error(&format!("unknown build rule '{}'", rule_name)))?
        };

        let mut ins = Vec::new();
        loop {
            // XXX should we require one path here?
            let mut input = EvalString::new();
            lexer.read_path(&mut input)?;
            if input.is_empty() {
                break;
            }
            ins.push(input);
        }

        // Add all implicit deps, counting how many as we go.
        let mut implicit = 0usize;
        if lexer.peek_token(LexerToken::Pipe) {
            loop {
                let mut input = EvalString::new();
                lexer.read_path(&mut input)?;
                if input.is_empty() {
                    break;
                }
                ins.push(input);
                implicit += 1;
            }
        }

        // Add all order-only deps, counting how many as we go.
        let mut order_only = 0usize;
        if lexer.peek_token(LexerToken::Pipe2) {
            loop {
                let mut input = EvalString::new();
                lexer.read_path(&mut input)?;
                if input.is_empty() {
                    break;
                }
                ins.push(input);
                order_only += 1;
            }
        }

        self.expect_token(lexer, LexerToken::Newline)?;

        // Bindings on edges are rare, so allocate per-edge envs only when
        // needed.
        let env = if lexer.peek_token(LexerToken::Indent) {
            let mut env = BindingEnv::new_with_parent(Some(self.env.clone()));
            loop {
                let (key, value) = self.parse_let(lexer)?;
                let evaluated_value = value.evaluate(&env);
                env.add_binding(&key, &evaluated_value);
                if !lexer.peek_token(LexerToken::Indent) {
                    break;
                }
            }
            Rc::new(RefCell::new(env))
        } else {
            self.env.clone()
        };

        let default_pool = self.state.default_pool();
        let edge_idx = self
            .state
            .edge_state
            .make_edge(rule, default_pool, env.clone());

        let pool_name = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            edge.get_binding(&self.state.node_state, "pool")
        };
        if !pool_name.is_empty() {
            let pool = self
                .state
                .pool_state
                .lookup_pool(&pool_name)
                .ok_or_else(|| lexer.error(&format!("unknown pool name '{}'", pool_name)))?
                .clone();
            self.state.edge_state.get_edge_mut(edge_idx).pool = pool;
        }

        let explicit_out_count = outs.len() - implicit_outs;
        let mut dropped_implicit_outs = 0usize;
        {
            for (i, out) in outs.iter().enumerate() {
                let path = out.evaluate(&*env.borrow());
                let (path, slash_bits) =
                    canonicalize_path(&path).map_err(|path_err| lexer.error(&path_err))?;

                let out_node_idx = self.state.node_state.prepare_node(&path, slash_bits);
                let connected = {
                    let (edge, node) = (
                        self.state.edge_state.get_edge_mut(edge_idx),
                        self.state.node_state.get_node_mut(out_node_idx),
                    );
                    State::connect_edge_to_out_node(edge, edge_idx, node, out_node_idx)
                };
                if !connected {
                    match self.options.dupe_edge_action {
                        DupeEdgeAction::Error => {
                            return Err(lexer.error(&format!(
                                "multiple rules generate {} [-w dupbuild=err]",
                                path
                            )));
                        }
                        DupeEdgeAction::Warn => {
                            if !self.quiet {
                                warning!(
                                    "multiple rules generate {}. builds involving this target \
                                     will not be correct; continuing anyway [-w dupbuild=warn]",
                                    path
                                );
                            }
                        }
                    }
                    if i >= explicit_out_count {
                        dropped_implicit_outs += 1;
                    }
                }
            }
        }

        if self.state.edge_state.get_edge(edge_idx).outputs.is_empty() {
            // All outputs of the edge are already created by other edges.
            // Don't add this edge.  Do this check before input nodes are
            // connected to the edge.
            self.state.edge_state.revoke_latest_edge(edge_idx);
            return Ok(());
        }
        self.state.edge_state.get_edge_mut(edge_idx).implicit_outs =
            implicit_outs - dropped_implicit_outs;

        for input in &ins {
            let path = input.evaluate(&*env.borrow());
            let (path, slash_bits) =
                canonicalize_path(&path).map_err(|path_err| lexer.error(&path_err))?;
            let in_node_idx = self.state.node_state.prepare_node(&path, slash_bits);
            let (edge, node) = (
                self.state.edge_state.get_edge_mut(edge_idx),
                self.state.node_state.get_node_mut(in_node_idx),
            );
            State::connect_edge_to_in_node(edge, edge_idx, node, in_node_idx);
        }
        {
            let edge = self.state.edge_state.get_edge_mut(edge_idx);
            edge.implicit_deps = implicit;
            edge.order_only_deps = order_only;
        }

        if self.options.phony_cycle_action == PhonyCycleAction::Warn
            && self
                .state
                .edge_state
                .get_edge(edge_idx)
                .maybe_phonycycle_diagnostic()
        {
            // CMake 2.8.12.x and 3.0.x incorrectly write phony build
            // statements that reference themselves.  We used to tolerate
            // these in the build graph but that has since been fixed.
            // Filter them out to support users of those old CMake
            // versions.
            let out_node_idx = self.state.edge_state.get_edge(edge_idx).outputs[0];
            let before = self.state.edge_state.get_edge(edge_idx).inputs.len();
            self.state
                .edge_state
                .get_edge_mut(edge_idx)
                .inputs
                .retain(|&input| input != out_node_idx);
            let removed = before - self.state.edge_state.get_edge(edge_idx).inputs.len();
            if removed > 0 && !self.quiet {
                let out_path = self
                    .state
                    .node_state
                    .get_node(out_node_idx)
                    .path()
                    .to_owned();
                warning!(
                    "phony target '{}' names itself as an input; ignoring [-w phonycycle=warn]",
                    out_path
                );
            }
        }

        // Multiple outputs aren't (yet?) supported with deps tracking.
        let deps_type = {
            let edge = self.state.edge_state.get_edge(edge_idx);
            edge.get_binding(&self.state.node_state, "deps")
        };
        if !deps_type.is_empty() && self.state.edge_state.get_edge(edge_idx).outputs.len() > 1 {
            return Err(lexer.error(
                "multiple outputs aren't (yet?) supported by depslog; bring this up on the \
                 mailing list if it affects you",
            ));
        }

        Ok(())
    }

    fn parse_default(&mut self, lexer: &mut Lexer) -> Result<(), String> {
        let mut any = false;

        loop {
            let mut eval = EvalString::new();
            lexer.read_path(&mut eval)?;
            if eval.is_empty() {
                break;
            }
            any = true;

            let path = eval.evaluate(&*self.env.borrow());
            let (path, _slash_bits) =
                canonicalize_path(&path).map_err(|err| lexer.error(&err))?;
            self.state
                .add_default(&path)
                .map_err(|err| lexer.error(&err))?;
        }

        if !any {
            return Err(lexer.error("expected target name"));
        }

        self.expect_token(lexer, LexerToken::Newline)
    }

    /// Parse either a 'subninja' or 'include' line.
    fn parse_file_include(&mut self, lexer: &mut Lexer, new_scope: bool) -> Result<(), String> {
        let mut eval = EvalString::new();
        lexer.read_path(&mut eval)?;
        let path = eval.evaluate(&*self.env.borrow());

        let env = if new_scope {
            Rc::new(RefCell::new(BindingEnv::new_with_parent(Some(
                self.env.clone(),
            ))))
        } else {
            self.env.clone()
        };

        {
            let mut subparser = ManifestParser::new_with_env(
                self.state,
                self.file_reader,
                self.options.clone(),
                env,
            );
            subparser.quiet = self.quiet;
            subparser.load_with_parent(&path, Some(&*lexer))?;
        }

        self.expect_token(lexer, LexerToken::Newline)
    }

    /// If the next token is not |expected|, produce an error string saying
    /// "expected foo, got bar".
    fn expect_token(&mut self, lexer: &mut Lexer, expected: LexerToken) -> Result<(), String> {
        let token = lexer.read_token();
        if token == expected {
            return Ok(());
        }
        let message = format!(
            "expected {}, got {}{}",
            expected.name(),
            token.name(),
            expected.error_hint()
        );
        Err(lexer.error(&message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval_env::Env;
    use crate::graph::EdgeIndex;
    use crate::test::{TestWithStateAndVFS, VirtualFileSystem};

    struct ParserTest {
        t: TestWithStateAndVFS,
    }

    impl ParserTest {
        fn new() -> Self {
            ParserTest {
                t: TestWithStateAndVFS::new_minimal(),
            }
        }

        fn assert_parse(&mut self, input: &str) {
            self.t.assert_parse(input);
        }

        fn assert_parse_error(&mut self, input: &str, err: &str) {
            self.t.assert_parse_error(input, err);
        }

        fn first_edge_command(&self) -> String {
            let edge = self.t.state.edge_state.get_edge(EdgeIndex(0));
            edge.evaluate_command(&self.t.state.node_state)
        }
    }

    #[test]
    fn parser_empty() {
        let mut p = ParserTest::new();
        p.assert_parse("");
    }

    #[test]
    fn parser_rules() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat\n",
            "  command = cat $in > $out\n",
            "\n",
            "rule date\n",
            "  command = date > $out\n",
            "\n",
            "build result: cat in_1.cc in-2.O\n",
        ));

        let bindings = p.t.state.bindings.borrow();
        // cat, date and the built-in phony.
        assert_eq!(3, bindings.get_rules().len());
        let rule = bindings.get_rules().values().next().unwrap();
        assert_eq!("cat", rule.name());
        assert_eq!(
            "[cat ][$in][ > ][$out]",
            rule.get_binding("command").unwrap().serialize()
        );
    }

    #[test]
    fn parser_rule_attributes() {
        // Check that all of the allowed rule attributes are parsed ok.
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat\n",
            "  command = a\n",
            "  depfile = a\n",
            "  deps = a\n",
            "  description = a\n",
            "  generator = a\n",
            "  restat = a\n",
            "  rspfile = a\n",
            "  rspfile_content = a\n",
        ));
    }

    #[test]
    fn parser_ignore_indented_comments() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "  #indented comment\n",
            "rule cat\n",
            "  command = cat $in > $out\n",
            "  #generator = 1\n",
            "  restat = 1 # comment\n",
            "  #comment\n",
            "build result: cat in_1.cc in-2.O\n",
            "  #comment\n",
        ));

        let node_idx = p.t.state.node_state.lookup_node("result").unwrap();
        let edge_idx = p.t.state.node_state.get_node(node_idx).in_edge().unwrap();
        let edge = p.t.state.edge_state.get_edge(edge_idx);
        assert!(edge.get_binding_bool(&p.t.state.node_state, "restat"));
        assert!(!edge.get_binding_bool(&p.t.state.node_state, "generator"));
    }

    #[test]
    fn parser_response_files() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat_rsp\n",
            "  command = cat $rspfile > $out\n",
            "  rspfile = $rspfile\n",
            "  rspfile_content = $in\n",
            "\n",
            "build out: cat_rsp in\n",
            "  rspfile=out.rsp\n",
        ));

        let node_idx = p.t.state.node_state.lookup_node("out").unwrap();
        let edge_idx = p.t.state.node_state.get_node(node_idx).in_edge().unwrap();
        let edge = p.t.state.edge_state.get_edge(edge_idx);
        assert_eq!(
            "out.rsp",
            edge.get_unescaped_rspfile(&p.t.state.node_state)
        );
        assert_eq!("in", edge.get_binding(&p.t.state.node_state, "rspfile_content"));
    }

    #[test]
    fn parser_in_newline() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat_rsp\n",
            "  command = cat $in_newline > $out\n",
            "\n",
            "build out: cat_rsp in in2\n",
        ));
        assert_eq!("cat in\nin2 > out", p.first_edge_command());
    }

    #[test]
    fn parser_variables() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "l = one-letter-test\n",
            "rule link\n",
            "  command = ld $l $extra $with_under -o $out $in\n",
            "\n",
            "extra = -pthread\n",
            "with_under = -under\n",
            "build a: link b c\n",
            "nested1 = 1\n",
            "nested2 = $nested1/2\n",
            "build supernested: link x\n",
            "  extra = $nested2/3\n",
        ));

        assert_eq!(2, p.t.state.edge_state.edge_count());
        assert_eq!(
            "ld one-letter-test -pthread -under -o a b c",
            p.first_edge_command()
        );
        assert_eq!(
            "1/2",
            p.t.state.bindings.borrow().lookup_variable("nested2")
        );
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(1));
        assert_eq!(
            "ld one-letter-test 1/2/3 -under -o supernested x",
            edge.evaluate_command(&p.t.state.node_state)
        );
    }

    #[test]
    fn parser_variable_scope() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "foo = bar\n",
            "rule cmd\n",
            "  command = cmd $foo $in $out\n",
            "\n",
            "build inner: cmd a\n",
            "  foo = baz\n",
            "build outer: cmd b\n",
            "\n", // Extra newline after build line tickles a regression.
        ));

        assert_eq!(2, p.t.state.edge_state.edge_count());
        assert_eq!("cmd baz a inner", p.first_edge_command());
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(1));
        assert_eq!(
            "cmd bar b outer",
            edge.evaluate_command(&p.t.state.node_state)
        );
    }

    #[test]
    fn parser_continuation() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule link\n",
            "  command = foo bar $\n",
            "    baz\n",
            "\n",
            "build a: link c $\n",
            " d e f\n",
        ));

        let bindings = p.t.state.bindings.borrow();
        let rule = bindings.get_rules().get("link").unwrap();
        assert_eq!(
            "[foo bar baz]",
            rule.get_binding("command").unwrap().serialize()
        );
    }

    #[test]
    fn parser_backslash() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!("foo = bar\\baz\n", "foo2 = bar\\ baz\n"));
        let bindings = p.t.state.bindings.borrow();
        assert_eq!("bar\\baz", bindings.lookup_variable("foo"));
        assert_eq!("bar\\ baz", bindings.lookup_variable("foo2"));
    }

    #[test]
    fn parser_comment() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "# this is a comment\n",
            "foo = not # a comment\n",
        ));
        assert_eq!(
            "not # a comment",
            p.t.state.bindings.borrow().lookup_variable("foo")
        );
    }

    #[test]
    fn parser_dollars() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule foo\n",
            "  command = ${out}bar$$baz$$$\n",
            "blah\n",
            "x = $$dollar\n",
            "build $x: foo y\n",
        ));
        assert_eq!("$dollar", p.t.state.bindings.borrow().lookup_variable("x"));
        if cfg!(windows) {
            assert_eq!("$dollarbar$baz$blah", p.first_edge_command());
        } else {
            assert_eq!("'$dollar'bar$baz$blah", p.first_edge_command());
        }
    }

    #[test]
    fn parser_escape_spaces() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule spaces\n",
            "  command = something\n",
            "build foo$ bar: spaces $$one two$$$ three\n",
        ));
        assert!(p.t.state.node_state.lookup_node("foo bar").is_some());
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(0));
        assert_eq!(
            "foo bar",
            p.t.state.node_state.get_node(edge.outputs[0]).path()
        );
        assert_eq!(
            "$one",
            p.t.state.node_state.get_node(edge.inputs[0]).path()
        );
        assert_eq!(
            "two$ three",
            p.t.state.node_state.get_node(edge.inputs[1]).path()
        );
        assert_eq!("something", p.first_edge_command());
    }

    #[test]
    fn parser_canonicalize_file() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat\n",
            "  command = cat $in > $out\n",
            "build out: cat in/1 in//2\n",
            "build in/1: cat\n",
            "build in/2: cat\n",
        ));

        assert!(p.t.state.node_state.lookup_node("in/1").is_some());
        assert!(p.t.state.node_state.lookup_node("in/2").is_some());
        assert!(p.t.state.node_state.lookup_node("in//1").is_none());
        assert!(p.t.state.node_state.lookup_node("in//2").is_none());
    }

    #[test]
    fn parser_implicit_outputs() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat\n",
            "  command = cat $in > $out\n",
            "build out | out.imp: cat in\n",
        ));
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(0));
        assert_eq!(2, edge.outputs.len());
        assert_eq!(1, edge.implicit_outs);
        // $out only covers explicit outputs.
        assert_eq!("cat in > out", p.first_edge_command());
    }

    #[test]
    fn parser_default() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "rule cat\n",
            "  command = cat $in > $out\n",
            "build a: cat foo\n",
            "build b: cat foo\n",
            "default a\n",
        ));
        let defaults = p.t.state.default_nodes().unwrap();
        assert_eq!(1, defaults.len());
        assert_eq!("a", p.t.state.node_state.get_node(defaults[0]).path());
    }

    #[test]
    fn parser_pools_and_edges() {
        let mut p = ParserTest::new();
        p.assert_parse(concat!(
            "pool link_pool\n",
            "  depth = 2\n",
            "rule link\n",
            "  command = link $in $out\n",
            "  pool = link_pool\n",
            "build out: link in\n",
        ));
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(0));
        assert_eq!("link_pool", edge.pool().borrow().name());
        assert_eq!(2, edge.pool().borrow().depth());
    }

    #[test]
    fn parser_duplicate_pool_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            "pool link\n  depth = 1\npool link\n  depth = 2\n",
            concat!(
                "input:3: duplicate pool 'link'\n",
                "pool link\n",
                "         ^ near here"
            ),
        );
    }

    #[test]
    fn parser_unknown_pool_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            concat!(
                "rule cat\n",
                "  command = cat\n",
                "  pool = nosuchpool\n",
                "build out: cat in\n",
            ),
            concat!(
                "input:5: unknown pool name 'nosuchpool'\n",
                "\n",
                "^ near here"
            ),
        );
    }

    #[test]
    fn parser_duplicate_rule_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            concat!(
                "rule cat\n",
                "  command = cat\n",
                "rule cat\n",
                "  command = cat\n",
            ),
            concat!(
                "input:3: duplicate rule 'cat'\n",
                "rule cat\n",
                "        ^ near here"
            ),
        );
    }

    #[test]
    fn parser_missing_command_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            "rule cat\n",
            concat!("input:2: expected 'command =' line\n", "\n", "^ near here"),
        );
    }

    #[test]
    fn parser_unknown_rule_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            "build out: nosuchrule in\n",
            concat!(
                "input:1: unknown build rule 'nosuchrule'\n",
                "build out: nosuchrule in\n",
                "           ^ near here"
            ),
        );
    }

    #[test]
    fn parser_expected_equals_error() {
        let mut p = ParserTest::new();
        p.assert_parse_error(
            "subn",
            concat!("input:1: expected '=', got eof\n", "subn\n", "    ^ near here"),
        );
    }

    #[test]
    fn parser_dupe_edge_error_mode() {
        let mut t = TestWithStateAndVFS::new_minimal();
        let options = ManifestParserOptions {
            dupe_edge_action: DupeEdgeAction::Error,
            ..Default::default()
        };
        let mut parser = ManifestParser::new(&mut t.state, &t.fs, options);
        let err = parser
            .parse_test(concat!(
                "rule cat\n",
                "  command = cat $in > $out\n",
                "build out: cat in\n",
                "build out: cat in\n",
            ))
            .unwrap_err();
        assert!(
            err.contains("multiple rules generate out [-w dupbuild=err]"),
            "got: {}",
            err
        );
    }

    #[test]
    fn parser_phony_self_reference_filtered_by_default() {
        let mut p = ParserTest::new();
        p.assert_parse("build a: phony a\n");
        let edge = p.t.state.edge_state.get_edge(EdgeIndex(0));
        // The self-input was dropped.
        assert!(edge.inputs.is_empty());
    }

    #[test]
    fn parser_include_and_subninja_scoping() {
        let mut t = TestWithStateAndVFS::new_minimal();
        t.fs.create("include.ninja", "var = inner\n");
        t.fs.create(
            "sub.ninja",
            concat!("subvar = sub\n", "build subout: subrule\n"),
        );

        let mut parser = ManifestParser::new(
            &mut t.state,
            &t.fs,
            ManifestParserOptions::default(),
        );
        parser
            .parse_test(concat!(
                "var = outer\n",
                "rule subrule\n",
                "  command = touch $out\n",
                "include include.ninja\n",
                "subninja sub.ninja\n",
            ))
            .unwrap();

        let bindings = t.state.bindings.borrow();
        // include edits the current scope...
        assert_eq!("inner", bindings.lookup_variable("var"));
        // ...while subninja gets its own child scope.
        assert_eq!("", bindings.lookup_variable("subvar"));
        drop(bindings);
        assert!(t.state.node_state.lookup_node("subout").is_some());
    }

    #[test]
    fn parser_missing_include_error() {
        let mut t = TestWithStateAndVFS::new_minimal();
        let fs = VirtualFileSystem::new();
        let mut parser = ManifestParser::new(
            &mut t.state,
            &fs,
            ManifestParserOptions::default(),
        );
        let err = parser.parse_test("include missing.ninja\n").unwrap_err();
        assert!(
            err.starts_with("input:1: loading 'missing.ninja':"),
            "got: {}",
            err
        );
    }

    #[test]
    fn parser_multiple_outputs_with_deps_error() {
        let mut p = ParserTest::new();
        p.t.assert_parse_error_containing(
            concat!(
                "rule cc\n",
                "  command = foo\n",
                "  deps = gcc\n",
                "build a.o b.o: cc c.cc\n",
            ),
            "multiple outputs aren't (yet?) supported by depslog",
        );
    }
}
