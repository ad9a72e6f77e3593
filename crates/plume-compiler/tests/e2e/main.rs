mod helpers;
mod test_diagnostics;
mod test_errors;
mod test_expressions;
mod test_extensions;
mod test_functions;
mod test_properties;
mod test_statements;
