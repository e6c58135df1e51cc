use proc_macro2::TokenStream;
use quote::{format_ident, quote};

pub fn generate_tests(dir: &str) -> TokenStream {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .unwrap_or_else(|err| panic!("cannot read test case directory {dir}: {err}"))
        .map(|entry| entry.expect("readable directory entry").path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // Deterministic test order regardless of directory iteration order.
    paths.sort();

    let mut tokens = Vec::new();
    for path in paths {
        let file_name = path
            .file_stem()
            .expect("file has a stem")
            .to_string_lossy()
            .replace('.', "_");
        let test_name = format_ident!("test_{}", file_name.to_lowercase());
        let path_str = path.to_string_lossy().into_owned();
        tokens.push(quote! {
            #[test]
            fn #test_name() {
                run_instruction_test_case(#path_str)
            }
        });
    }
    quote! {
        #(#tokens)*
    }
}
