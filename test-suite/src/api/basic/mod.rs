mod test_errors;
mod test_interceptor;
mod test_persist;
mod test_registry;
mod test_remote;
