pub mod site_matrix;
