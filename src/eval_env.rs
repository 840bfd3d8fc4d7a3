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

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

/// An interface for a scope for variable (e.g. "$foo") lookups.
pub trait Env {
    fn lookup_variable(&self, var: &str) -> Cow<str>;
}

#[derive(PartialEq, Clone, Copy)]
enum TokenType {
    Raw,
    Special,
}

/// A tokenized string that contains variable references.
/// Can be evaluated relative to an Env.
#[derive(Clone, Default)]
pub struct EvalString {
    parsed: Vec<(String, TokenType)>,
}

impl EvalString {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn evaluate<E: Env + ?Sized>(&self, env: &E) -> String {
        let mut result = String::new();
        for (text, token_type) in &self.parsed {
            match token_type {
                TokenType::Raw => result.push_str(text),
                TokenType::Special => result.push_str(&env.lookup_variable(text)),
            }
        }
        result
    }

    pub fn clear(&mut self) {
        self.parsed.clear()
    }

    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }

    pub fn add_text(&mut self, text: &str) {
        if let Some(last) = self.parsed.last_mut() {
            if last.1 == TokenType::Raw {
                last.0.push_str(text);
                return;
            }
        }
        self.parsed.push((text.to_owned(), TokenType::Raw));
    }

    pub fn add_special(&mut self, text: &str) {
        self.parsed.push((text.to_owned(), TokenType::Special));
    }

    /// Construct a human-readable representation of the parsed state,
    /// for use in tests.
    pub(crate) fn serialize(&self) -> String {
        let mut result = String::new();
        for (text, token_type) in &self.parsed {
            result.push('[');
            if *token_type == TokenType::Special {
                result.push('$');
            }
            result.push_str(text);
            result.push(']');
        }
        result
    }
}

impl fmt::Debug for EvalString {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "EvalString {{ {} }}", self.serialize())
    }
}

/// An invokable build command and associated metadata (description, etc.).
pub struct Rule {
    name: String,
    pub(crate) bindings: HashMap<String, EvalString>,
}

impl Rule {
    pub fn new(name: String) -> Self {
        Rule {
            name,
            bindings: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_binding(&mut self, key: &str, val: &EvalString) {
        self.bindings.insert(key.to_owned(), val.clone());
    }

    pub fn is_reserved_binding(var: &str) -> bool {
        var == "command"
            || var == "depfile"
            || var == "description"
            || var == "deps"
            || var == "generator"
            || var == "pool"
            || var == "restat"
            || var == "rspfile"
            || var == "rspfile_content"
            || var == "msvc_deps_prefix"
    }

    pub fn get_binding(&self, key: &str) -> Option<&EvalString> {
        self.bindings.get(key)
    }
}

/// An Env which contains a mapping of variables to values
/// as well as a pointer to a parent scope.
pub struct BindingEnv {
    bindings: BTreeMap<String, String>,
    rules: BTreeMap<String, Rc<Rule>>,
    parent: Option<Rc<RefCell<BindingEnv>>>,
}

impl BindingEnv {
    pub fn new() -> Self {
        BindingEnv {
            bindings: BTreeMap::new(),
            rules: BTreeMap::new(),
            parent: None,
        }
    }

    pub fn new_with_parent(parent: Option<Rc<RefCell<BindingEnv>>>) -> Self {
        BindingEnv {
            bindings: BTreeMap::new(),
            rules: BTreeMap::new(),
            parent,
        }
    }

    pub fn add_binding(&mut self, key: &str, val: &str) {
        self.bindings.insert(key.to_owned(), val.to_owned());
    }

    pub fn lookup_rule_current_scope(&self, rule_name: &str) -> Option<&Rc<Rule>> {
        self.rules.get(rule_name)
    }

    pub fn lookup_rule(&self, rule_name: &str) -> Option<Rc<Rule>> {
        if let Some(rule) = self.rules.get(rule_name) {
            return Some(rule.clone());
        }
        if let Some(parent) = &self.parent {
            return parent.borrow().lookup_rule(rule_name);
        }
        None
    }

    pub fn add_rule(&mut self, rule: Rc<Rule>) {
        debug_assert!(self.lookup_rule_current_scope(rule.name()).is_none());
        self.rules.insert(rule.name().to_owned(), rule);
    }

    pub fn get_rules(&self) -> &BTreeMap<String, Rc<Rule>> {
        &self.rules
    }

    /// This is tricky.  Edges want lookup scope to go in this order:
    /// 1) value set on edge itself (edge's env)
    /// 2) value set on rule, with expansion in the edge's scope
    /// 3) value set on enclosing scope of edge (edge's env's parent)
    /// This function takes as parameters the necessary info to do (2).
    pub fn lookup_with_fallback(
        &self,
        var: &str,
        eval: Option<&EvalString>,
        env: &dyn Env,
    ) -> String {
        if let Some(binding) = self.bindings.get(var) {
            return binding.clone();
        }
        if let Some(eval) = eval {
            return eval.evaluate(env);
        }
        if let Some(parent) = &self.parent {
            return parent.borrow().lookup_variable(var).into_owned();
        }
        String::new()
    }
}

impl Default for BindingEnv {
    fn default() -> Self {
        BindingEnv::new()
    }
}

impl Env for BindingEnv {
    fn lookup_variable(&self, var: &str) -> Cow<str> {
        if let Some(binding) = self.bindings.get(var) {
            return Cow::Borrowed(binding);
        }
        if let Some(parent) = &self.parent {
            return Cow::Owned(parent.borrow().lookup_variable(var).into_owned());
        }
        Cow::Borrowed("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_string_coalesces_text() {
        let mut eval = EvalString::new();
        eval.add_text("foo ");
        eval.add_text("bar");
        eval.add_special("baz");
        assert_eq!("[foo bar][$baz]", eval.serialize());
    }

    #[test]
    fn binding_env_parent_chain() {
        let outer = Rc::new(RefCell::new(BindingEnv::new()));
        outer.borrow_mut().add_binding("foo", "outer");
        outer.borrow_mut().add_binding("only_outer", "yes");

        let mut inner = BindingEnv::new_with_parent(Some(outer));
        inner.add_binding("foo", "inner");

        assert_eq!("inner", inner.lookup_variable("foo"));
        assert_eq!("yes", inner.lookup_variable("only_outer"));
        assert_eq!("", inner.lookup_variable("missing"));
    }

    #[test]
    fn rule_reserved_bindings() {
        assert!(Rule::is_reserved_binding("command"));
        assert!(Rule::is_reserved_binding("msvc_deps_prefix"));
        assert!(!Rule::is_reserved_binding("cflags"));
    }
}
