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

/// Parser for the Makefile-style dependency fragments that compilers emit
/// (gcc -MD and friends): `out: in1 in2 \` continuations, `\ ` escaped
/// spaces, `$$` dollars.  No variable expansion.
#[derive(Default, Debug)]
pub struct DepfileParser {
    pub outs: Vec<String>,
    pub ins: Vec<String>,
}

impl DepfileParser {
    /// Parse an entire depfile.  An empty file parses successfully and
    /// means "no deps".
    pub fn parse(content: &str) -> Result<DepfileParser, String> {
        let bytes = content.as_bytes();
        let len = bytes.len();

        let mut result = DepfileParser::default();
        // Outputs seen in the current rule, before its ':'.
        let mut pending: Vec<String> = Vec::new();
        let mut word: Vec<u8> = Vec::new();
        let mut after_colon = false;

        fn finish_word(
            word: &mut Vec<u8>,
            pending: &mut Vec<String>,
            ins: &mut Vec<String>,
            after_colon: bool,
        ) {
            if word.is_empty() {
                return;
            }
            // Words are built from whole bytes of valid UTF-8 input, split
            // only at ASCII delimiters.
            let text = String::from_utf8_lossy(word).into_owned();
            if after_colon {
                ins.push(text);
            } else {
                pending.push(text);
            }
            word.clear();
        }

        let mut i = 0usize;
        while i < len {
            match bytes[i] {
                b'\\' => match bytes.get(i + 1) {
                    // A backslash-newline is a line continuation.
                    Some(b'\n') => {
                        finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
                        i += 2;
                    }
                    Some(b'\r') if bytes.get(i + 2) == Some(&b'\n') => {
                        finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
                        i += 3;
                    }
                    // An escaped space or hash belongs to the path.
                    Some(&b' ') | Some(&b'#') => {
                        word.push(bytes[i + 1]);
                        i += 2;
                    }
                    // Otherwise keep the backslash; Windows paths use them.
                    _ => {
                        word.push(b'\\');
                        i += 1;
                    }
                },
                b'$' if bytes.get(i + 1) == Some(&b'$') => {
                    word.push(b'$');
                    i += 2;
                }
                b':' => {
                    // A colon ends the target list when followed by
                    // whitespace or the end of the line; otherwise (e.g.
                    // "C:\foo") it is part of the path.
                    match bytes.get(i + 1) {
                        None | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                            finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
                            result.outs.append(&mut pending);
                            after_colon = true;
                            i += 1;
                        }
                        _ => {
                            word.push(b':');
                            i += 1;
                        }
                    }
                }
                b' ' | b'\t' | b'\r' => {
                    finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
                    i += 1;
                }
                b'\n' => {
                    finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
                    if !after_colon && !pending.is_empty() {
                        return Err("expected ':' in depfile".to_owned());
                    }
                    after_colon = false;
                    i += 1;
                }
                c => {
                    word.push(c);
                    i += 1;
                }
            }
        }

        finish_word(&mut word, &mut pending, &mut result.ins, after_colon);
        if !after_colon && !pending.is_empty() {
            return Err("expected ':' in depfile".to_owned());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> DepfileParser {
        DepfileParser::parse(input).unwrap()
    }

    #[test]
    fn depfile_basic() {
        let p = parse("build/browse.o: src/browse.cc src/browse.h build/browse_py.h\n");
        assert_eq!(vec!["build/browse.o"], p.outs);
        assert_eq!(
            vec!["src/browse.cc", "src/browse.h", "build/browse_py.h"],
            p.ins
        );
    }

    #[test]
    fn depfile_early_newline_and_whitespace() {
        let p = parse(" \\\n  out.o: in1.cc in2.cc\n");
        assert_eq!(vec!["out.o"], p.outs);
        assert_eq!(vec!["in1.cc", "in2.cc"], p.ins);
    }

    #[test]
    fn depfile_continuation() {
        let p = parse("foo.o: \\\n  bar.h baz.h\n");
        assert_eq!(vec!["foo.o"], p.outs);
        assert_eq!(vec!["bar.h", "baz.h"], p.ins);
    }

    #[test]
    fn depfile_carriage_return_continuation() {
        let p = parse("foo.o: \\\r\n  bar.h baz.h\r\n");
        assert_eq!(vec!["foo.o"], p.outs);
        assert_eq!(vec!["bar.h", "baz.h"], p.ins);
    }

    #[test]
    fn depfile_escaped_spaces() {
        let p = parse("a\\ b\\ c.o: path\\ with\\ spaces.h\n");
        assert_eq!(vec!["a b c.o"], p.outs);
        assert_eq!(vec!["path with spaces.h"], p.ins);
    }

    #[test]
    fn depfile_windows_paths() {
        let p = parse("odd/path.o: C:/odd\\path.c C:\\other\\path.h\n");
        assert_eq!(vec!["odd/path.o"], p.outs);
        assert_eq!(vec!["C:/odd\\path.c", "C:\\other\\path.h"], p.ins);
    }

    #[test]
    fn depfile_dollars_and_hashes() {
        let p = parse("foo.o: x$$y.h a\\#tag.h\n");
        assert_eq!(vec!["foo.o"], p.outs);
        assert_eq!(vec!["x$y.h", "a#tag.h"], p.ins);
    }

    #[test]
    fn depfile_spaces_before_colon() {
        let p = parse("build/browse.o   : src/browse.cc");
        assert_eq!(vec!["build/browse.o"], p.outs);
        assert_eq!(vec!["src/browse.cc"], p.ins);
    }

    #[test]
    fn depfile_without_final_newline() {
        let p = parse("build/browse.o: src/browse.cc");
        assert_eq!(vec!["build/browse.o"], p.outs);
        assert_eq!(vec!["src/browse.cc"], p.ins);
    }

    #[test]
    fn depfile_multiple_rules() {
        let p = parse("out/a.o: src/a.c \\\n  src/b.c\n\nout/b.o :\n");
        assert_eq!(vec!["out/a.o", "out/b.o"], p.outs);
        assert_eq!(vec!["src/a.c", "src/b.c"], p.ins);
    }

    #[test]
    fn depfile_empty_is_valid() {
        let p = parse("");
        assert!(p.outs.is_empty());
        assert!(p.ins.is_empty());
    }

    #[test]
    fn depfile_missing_colon_is_an_error() {
        assert_eq!(
            Err("expected ':' in depfile".to_owned()),
            DepfileParser::parse("foo bar\n").map(|_| ())
        );
    }
}
