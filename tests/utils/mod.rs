pub mod mock_tcp_stream;
