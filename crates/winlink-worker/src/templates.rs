//! Templates every worker ships with.
//!
//! All of them are python programs that print their result as one JSON
//! object on the last stdout line. Structured parameters (numbers, lists,
//! matrices) are JSON text.

use std::collections::BTreeMap;

use crate::config::TemplateConfig;

const HELLO_WORLD: &str = r#"import json
name = """{{name}}"""
message = f"Hello, {name}!"
print(json.dumps({"message": message, "length": len(message), "uppercase": message.upper()}))
"#;

const FIBONACCI: &str = r#"import json
n = int("{{n}}")
series = [0, 1][:max(n, 0)]
while len(series) < n:
    series.append(series[-1] + series[-2])
a, b = 0, 1
for _ in range(max(n, 0)):
    a, b = b, a + b
print(json.dumps({"series": series, "nth_number": a, "count": len(series), "sum": sum(series)}))
"#;

const PRIME_CHECK: &str = r#"import json
number = int("{{number}}")
prime = number >= 2 and all(number % i for i in range(2, int(number ** 0.5) + 1))
print(json.dumps({"number": number, "is_prime": prime}))
"#;

const FACTORIAL: &str = r#"import json, math
n = int("{{n}}")
if n < 0:
    raise SystemExit("factorial is not defined for negative numbers")
print(json.dumps({"number": n, "factorial": str(math.factorial(n)), "formula": f"{n}!"}))
"#;

const MATRIX_MULTIPLY: &str = r#"import json
a = json.loads("""{{matrix_a}}""")
b = json.loads("""{{matrix_b}}""")
if not a or not b or len(a[0]) != len(b):
    raise SystemExit("cannot multiply matrices of these shapes")
product = [[sum(a[i][k] * b[k][j] for k in range(len(b))) for j in range(len(b[0]))] for i in range(len(a))]
print(json.dumps({"result": product}))
"#;

const DATA_PROCESSING: &str = r#"import json, statistics
numbers = json.loads("""{{numbers}}""")
if not numbers:
    raise SystemExit("no numbers given")
print(json.dumps({
    "count": len(numbers),
    "sum": sum(numbers),
    "mean": statistics.mean(numbers),
    "median": statistics.median(numbers),
    "std_dev": statistics.stdev(numbers) if len(numbers) > 1 else 0,
    "min": min(numbers),
    "max": max(numbers),
}))
"#;

const TEXT_ANALYSIS: &str = r#"import json
text = """{{text}}"""
lines = text.split("\n")
words = text.split()
print(json.dumps({
    "line_count": len(lines),
    "word_count": len(words),
    "char_count": len(text),
    "char_count_no_spaces": len(text.replace(" ", "")),
    "avg_words_per_line": len(words) / len(lines),
}))
"#;

fn python(source: &str, defaults: &[(&str, &str)]) -> TemplateConfig {
    TemplateConfig {
        interpreter: "python".to_string(),
        source: source.to_string(),
        defaults: defaults
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

/// The built-in template table.
pub fn builtin() -> BTreeMap<String, TemplateConfig> {
    [
        ("hello_world", python(HELLO_WORLD, &[("name", "World")])),
        ("fibonacci", python(FIBONACCI, &[("n", "10")])),
        ("prime_check", python(PRIME_CHECK, &[])),
        ("factorial", python(FACTORIAL, &[("n", "10")])),
        ("matrix_multiply", python(MATRIX_MULTIPLY, &[])),
        ("data_processing", python(DATA_PROCESSING, &[])),
        ("text_analysis", python(TEXT_ANALYSIS, &[])),
    ]
    .into_iter()
    .map(|(name, template)| (name.to_string(), template))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_placeholders_are_known() {
        for (name, template) in builtin() {
            assert_eq!(template.interpreter, "python", "{}", name);
            for key in template.defaults.keys() {
                assert!(
                    template.source.contains(&format!("{{{{{}}}}}", key)),
                    "{} default '{}' has no placeholder",
                    name,
                    key
                );
            }
        }
        assert_eq!(builtin().len(), 7);
    }
}
