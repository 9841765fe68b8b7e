/// Maps byte offsets to line/column positions within source text.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line + 1, col + 1)
    }

    /// 1-based (line, col) of the start of `span`.
    pub fn locate(&self, span: super::Span) -> (usize, usize) {
        self.lookup(span.start)
    }

    /// Returns the full text of the given 1-based line number.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = if line < self.line_starts.len() {
            self.line_starts[line]
        } else {
            source.len()
        };
        // Trim trailing newline
        let text = &source[start..end];
        text.trim_end_matches('\n').trim_end_matches('\r')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[test]
    fn single_line() {
        let src = "fn main() { return 1; }";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(3), (1, 4));
        assert_eq!(sm.lookup(src.len()), (1, src.len() + 1));
    }

    #[test]
    fn multi_line() {
        let src = "fn main() {\n  x = 1;\n}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(10), (1, 11)); // '{'
        assert_eq!(sm.lookup(11), (1, 12)); // '\n' stays on line 1
        assert_eq!(sm.lookup(14), (2, 3)); // 'x'
        assert_eq!(sm.lookup(21), (3, 1)); // '}'
    }

    #[test]
    fn locate_span() {
        let src = "fn a() {}\nfn b() {}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.locate(Span { start: 13, end: 14 }), (2, 4));
    }

    #[test]
    fn line_text() {
        let src = "fn a() {\r\n  return;\n}\n";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "fn a() {");
        assert_eq!(sm.line_text(src, 2), "  return;");
        assert_eq!(sm.line_text(src, 3), "}");
        assert_eq!(sm.line_text(src, 4), "");
    }

    #[test]
    fn line_text_out_of_bounds() {
        let src = "fn a() {}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 99), "");
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.line_text("", 1), "");
    }
}
