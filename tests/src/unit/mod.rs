mod fan_out_tests;
mod session_tests;
