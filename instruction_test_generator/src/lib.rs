use proc_macro::TokenStream;
use syn::{LitStr, parse_macro_input};

mod test_generator;

/// Expand a directory of JSON instruction-state vectors into one `#[test]`
/// function per file, each calling `run_instruction_test_case(path)`.
#[proc_macro]
pub fn generate_instruction_tests(input: TokenStream) -> TokenStream {
    let dir: LitStr = parse_macro_input!(input);
    test_generator::generate_tests(&dir.value()).into()
}
