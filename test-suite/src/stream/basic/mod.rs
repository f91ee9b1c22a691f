mod test_bidi;
mod test_client_stream;
mod test_server_stream;
